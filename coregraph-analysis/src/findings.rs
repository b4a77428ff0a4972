//! Findings produced by the integrity analyzer

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a finding claims about the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingKind {
    /// A pointer edge targets an unmapped address
    DanglingPointer,
    /// A pointer edge targets memory inside a free allocator chunk
    UseAfterFree,
    /// An object's recovered dynamic type contradicts its static type
    TypeConfusion,
    /// Allocator metadata violates its own structural invariants
    CorruptedAllocatorMetadata,
    /// An object that should carry a vtable pointer does not resolve to one
    InvalidVtable,
    /// An accessor walk exceeded its step or iteration budget, implicating
    /// possible corruption of the structure being walked
    EvaluationDivergence,
    /// Unreachable allocation with no reference to its base address
    DefiniteLeak,
    /// Unreachable allocation referenced only at a non-zero offset
    PossibleLeak,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FindingKind::DanglingPointer => "dangling-pointer",
            FindingKind::UseAfterFree => "use-after-free",
            FindingKind::TypeConfusion => "type-confusion",
            FindingKind::CorruptedAllocatorMetadata => "corrupted-allocator-metadata",
            FindingKind::InvalidVtable => "invalid-vtable",
            FindingKind::EvaluationDivergence => "evaluation-divergence",
            FindingKind::DefiniteLeak => "definite-leak",
            FindingKind::PossibleLeak => "possible-leak",
        };
        write!(f, "{s}")
    }
}

/// One finding: a kind, the address it implicates, and supporting evidence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub address: u64,
    pub evidence: String,
}

impl Finding {
    pub fn new(kind: FindingKind, address: u64, evidence: impl Into<String>) -> Self {
        Self {
            kind,
            address,
            evidence: evidence.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x}: {}", self.kind, self.address, self.evidence)
    }
}
