//! Error types for power station communication.

use thiserror::Error;

/// Result type alias for protocol client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the client and the power station.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Response too short, or its message-kind tag is not the one expected
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Connect, resolve, subscribe or write failed at the transport layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// A connection attempt did not complete within the configured timeout
    #[error("Connection attempt timed out")]
    Timeout,

    /// Reconnects are suspended until the manager is re-armed
    #[error("Gave up after {failures} consecutive connection failures")]
    GaveUp {
        /// Consecutive failures that triggered the give-up
        failures: u32,
    },

    /// A request was issued while the link is not ready
    #[error("Not connected")]
    NotConnected,

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Transport(format!("{err:#}"))
    }
}
