//! Server error types.

use thiserror::Error;

/// Errors surfaced by the accept loop and connection tasks.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level error from the packet codec.
    #[error("protocol error: {0}")]
    Protocol(#[from] iris_core::error::Error),
}
