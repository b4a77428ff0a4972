//! Postmortem object and allocation graph analysis
//!
//! This crate turns a memory image plus descriptor catalogs into a queryable
//! graph: every discovered object with its static and recovered type, every
//! reconstructed allocation with its used/free state, every pointer edge with
//! its validity, and the findings (leaks, corruption, dangling pointers,
//! type confusion) the integrity analyzer derives from them.
//!
//! The engine analyzes programs that may themselves be broken. Nothing here
//! assumes well-formed input: every walk is budgeted, every violation becomes
//! a finding, and a module with missing debug information degrades to
//! partial results instead of failing the analysis.

pub mod alloc;
pub mod analyzer;
pub mod classify;
pub mod config;
pub mod diff;
pub mod findings;
pub mod graph;
pub mod iterate;
pub mod reach;
pub mod recover;
pub mod report;
pub mod roots;
pub mod traverse;

pub use alloc::{AllocationCatalog, AllocatorLayout, HeapArena, RawAllocation};
pub use analyzer::{
    index_modules, index_modules_sequential, index_modules_with_progress, AnalysisEvent,
    CoreAnalyzer, ModuleInput, ModuleSymbolSource,
};
pub use classify::{Capability, CapabilityClassifier, CapabilityTag, ClassifyContext};
pub use config::AnalysisConfig;
pub use diff::{diff_reports, SnapshotDiff};
pub use findings::{Finding, FindingKind};
pub use graph::{
    AllocationId, AllocationNode, ChunkState, EdgeValidity, ObjectGraph, ObjectId, ObjectNode,
    PointerEdge, TargetRef,
};
pub use reach::{analyze_reachability, rank_allocations};
pub use recover::{RecoveredType, RecoveryVia, TypeRecovery};
pub use report::{AnalysisReport, AnalysisStats};
pub use roots::{enumerate_global_roots, enumerate_thread_local_roots, RootKind, RootReference};
pub use traverse::GraphBuilder;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;
