//! Error types for the core library.

use thiserror::Error;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Buffer too short to hold a wire header
    #[error("Short header: need {need} bytes, got {got}")]
    ShortHeader { need: usize, got: usize },
    /// Invalid node identifier
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    /// Caller buffer does not match the header's declared length
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),
}
