//! Memory image and module view for postmortem core analysis
//!
//! A [`MemoryImage`] is the single immutable input every analysis derives
//! from: a set of non-overlapping mapped regions with permissions, read but
//! never written. [`ModuleMap`] layers the per-module view on top: load
//! biases, symbol tables and the vtable address-point index used for dynamic
//! type recovery.

pub mod image;
pub mod modules;
pub mod symbols;

pub use image::{ImageError, MemoryImage, MemoryRegion, Permissions};
pub use modules::{MappedModule, ModuleMap};
pub use symbols::{Symbol, SymbolKind, SymbolTable, VtableHit, VtableIndex};
