//! Accessor lifting and bounded evaluation
//!
//! Compiled accessor functions (container `begin`/`end`, iterator dereference
//! and increment, smart-pointer `get`, tagged-union `get_if`) are lifted from
//! their machine code into a small register-machine program that can be
//! evaluated against the memory image — so generic containers can be walked
//! without per-type hand-written logic, and without ever executing target
//! code.
//!
//! The lifter is a whitelist: it recognizes a few dozen common x86-64
//! encodings and refuses everything else explicitly. Evaluation is bounded by
//! a step budget because the memory being read may be corrupted; divergence
//! is a reported failure, never a hang.

pub mod cache;
pub mod decode;
pub mod error;
pub mod interp;
pub mod program;
pub mod substitute;

pub use cache::{AccessorCache, AccessorKey};
pub use decode::AccessorLifter;
pub use error::{EvalError, LiftError};
pub use interp::{Evaluator, DEFAULT_STEP_BUDGET};
pub use program::{AccessorOp, AccessorProgram, AluOp, Cond, MemRef, RValue, Reg};
pub use substitute::resolve_function_body;
