//! Error types for lifting and evaluation

/// Lifting failures. Each one marks a single accessor unavailable; the
/// classifier downgrades the owning type to Opaque rather than iterating it
/// partially.
#[derive(thiserror::Error, Debug)]
pub enum LiftError {
    #[error("unsupported instruction `{mnemonic}` at {address:#x}")]
    UnsupportedInstruction { mnemonic: String, address: u64 },
    #[error("unsupported operand form for `{mnemonic}` at {address:#x}")]
    UnsupportedOperand { mnemonic: String, address: u64 },
    #[error("branch target {target:#x} is outside the lifted function")]
    InvalidBranchTarget { target: u64 },
    #[error("function `{linkage}` has no machine code to lift")]
    MissingBody { linkage: String },
    #[error("ODR mismatch for `{symbol}`: {reason}")]
    OdrMismatch { symbol: String, reason: String },
    #[error("accessor previously failed to lift: {reason}")]
    PreviouslyFailed { reason: String },
    #[error("disassembly failed: {0}")]
    Disassembly(String),
}

/// Evaluation failures. These are findings-grade events: the memory walked
/// may be corrupted, so they are reported and traversal continues.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("evaluation exceeded the step budget of {budget}")]
    Divergence { budget: usize },
    #[error("dereference of unmapped address {addr:#x}")]
    InvalidMemoryReference { addr: u64 },
    #[error("store outside the scratch frame at {addr:#x}")]
    StoreOutsideScratch { addr: u64 },
    #[error("program ran past its last operation")]
    NoReturn,
    #[error("conditional executed before any compare")]
    FlagsUnset,
}

impl From<capstone::Error> for LiftError {
    fn from(e: capstone::Error) -> Self {
        LiftError::Disassembly(e.to_string())
    }
}
