//! Client Error Taxonomy
//!
//! One umbrella error type for everything a caller can observe from a
//! subscription stream. Connection-level failures fan out to every
//! subscription waiting on the shared connection, so the type is `Clone`:
//! failure details are carried as strings or JSON payloads rather than
//! boxed source chains.

use serde_json::Value;

/// Errors surfaced to subscription callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RealtimeError {
    /// The authorization provider failed to produce headers.
    #[error("authorization provider failed: {0}")]
    Auth(String),

    /// Socket-level failure (open, send, or receive).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server rejected the connection with an error frame carrying no
    /// subscription id.
    #[error("connection error: {payload}")]
    Connection {
        /// Error payload from the server.
        payload: Value,
    },

    /// No `connection_ack` arrived within the attempt timeout.
    #[error("connection handshake timed out")]
    HandshakeTimeout,

    /// The socket closed before the handshake completed.
    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// No `start_ack` arrived for a start attempt within the attempt timeout.
    #[error("subscription start timed out")]
    StartTimeout,

    /// The server sent an error frame for this subscription id.
    #[error("subscription error: {payload}")]
    Subscription {
        /// Error payload from the server.
        payload: Value,
    },

    /// An inbound frame could not be decoded, or an outbound frame could not
    /// be encoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The configured API endpoint could not be turned into a realtime URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl RealtimeError {
    /// Whether this error terminated the shared connection rather than a
    /// single subscription.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        !matches!(self, Self::StartTimeout | Self::Subscription { .. })
    }
}

impl From<crate::transport::TransportError> for RealtimeError {
    fn from(err: crate::transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<crate::frames::FrameError> for RealtimeError {
    fn from(err: crate::frames::FrameError) -> Self {
        Self::Protocol(err.to_string())
    }
}
