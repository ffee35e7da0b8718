//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the lanchat_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect/send/receive on an established link).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote sent a frame that is valid JSON but not acceptable here.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame exceeded the configured maximum size.
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The local LAN address could not be determined.
    #[error("Local network address unavailable: {0}")]
    AddressUnavailable(String),

    /// The chat listener could not be bound (usually: port already in use).
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a remote host failed.
    #[error("Connection to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The session is not running.
    #[error("Session not running")]
    NotRunning,

    /// The session was stopped and cannot be started again.
    #[error("Session already stopped; create a new session")]
    SessionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether the error came from the bytes a peer sent rather than from the
    /// socket itself.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Serialization(_) | Self::FrameTooLarge { .. }
        )
    }
}
