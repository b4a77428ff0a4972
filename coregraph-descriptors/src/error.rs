//! Error types for the descriptor layer

/// Errors raised while resolving descriptors. Every variant degrades a single
/// module or lookup; none aborts a whole analysis.
#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("module {build_id} is missing debug information: {what}")]
    MissingDebugInfo { build_id: String, what: String },
    #[error("ODR mismatch for `{symbol}`: {reason}")]
    OdrMismatch { symbol: String, reason: String },
    #[error("no module registered for build id {build_id}")]
    UnknownModule { build_id: String },
    #[error("type `{name}` not found in any registered module")]
    TypeNotFound { name: String },
}

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;
