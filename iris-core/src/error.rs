//! Error types for the iris MQTT broker.

use thiserror::Error;

/// Error type for iris operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The packet is incomplete and needs more data.
    #[error("packet is not complete")]
    Incomplete,

    /// The packet violates the MQTT v3.1.1 wire format.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The peer broke a protocol rule that forces a disconnect.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
