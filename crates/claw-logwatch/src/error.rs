//! Error types for the log watch pipeline.

use thiserror::Error;

/// Errors that can occur in the log watch pipeline.
///
/// Most pipeline conditions degrade rather than fail; these variants cover
/// configuration problems, I/O inside the line source, and contract
/// violations by callers.
#[derive(Debug, Error)]
pub enum LogwatchError {
    /// The monitored file does not exist (yet).
    #[error("monitored file not found: {0}")]
    SourceMissing(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record was appended with a sequence number that does not follow the
    /// last appended one.
    #[error("out-of-order append: sequence {got} after {last}")]
    OutOfOrder {
        /// Last sequence number accepted by the buffer.
        last: u64,
        /// Sequence number that was rejected.
        got: u64,
    },

    /// A pattern rule could not be compiled.
    #[error("invalid rule '{name}': {reason}")]
    InvalidRule {
        /// Name of the offending rule.
        name: String,
        /// Why compilation failed.
        reason: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pipeline task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Result type alias for log watch operations.
pub type Result<T> = std::result::Result<T, LogwatchError>;
