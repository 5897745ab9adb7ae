//! Realtime Wire Frames
//!
//! Wire format types for the AppSync realtime protocol. Every frame is a
//! JSON object with a `type` discriminator; subscription-scoped frames also
//! carry the correlation `id` that routes them to a single subscription.
//!
//! # Frame Types
//!
//! ## Client → Server
//! - `connection_init`: open handshake
//! - `start`: begin a subscription (query, variables, authorization)
//! - `stop`: client-initiated cancel
//!
//! ## Server → Client
//! - `connection_ack`: handshake accepted; carries the keep-alive interval
//! - `ka`: keep-alive heartbeat
//! - `start_ack`: subscription accepted
//! - `data`: subscription event
//! - `complete`: subscription ended normally
//! - `error`: fatal connection error (no id) or subscription error (with id)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Headers;

/// AppSync service default keep-alive interval, used when `connection_ack`
/// omits `connectionTimeoutMs`.
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 300_000;

// =============================================================================
// Errors
// =============================================================================

/// Frame encode/decode errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// Inbound text could not be parsed as a protocol frame.
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

// =============================================================================
// Outbound Frames (Client -> Server)
// =============================================================================

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Open the protocol handshake after the socket connects.
    ConnectionInit,

    /// Begin a subscription.
    Start {
        /// Correlation id, unique per start attempt.
        id: String,
        /// Query, variables and authorization data.
        payload: StartPayload,
    },

    /// Cancel a subscription.
    Stop {
        /// Correlation id of the subscription to cancel.
        id: String,
    },
}

/// Payload of a `start` frame.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "data": "{\"query\":\"subscription ...\",\"variables\":{}}",
///   "extensions": {"authorization": {"x-api-key": "..."}}
/// }
/// ```
///
/// `data` is a JSON-encoded *string* of the query document and variables,
/// not a nested object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    /// JSON-encoded `{query, variables}` string.
    pub data: String,

    /// Protocol extensions.
    pub extensions: StartExtensions,
}

/// Extensions of a `start` frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExtensions {
    /// Resolved subscription-level authorization headers.
    pub authorization: Headers,
}

impl StartPayload {
    /// Build a start payload from an opaque query document, variables and
    /// resolved authorization headers.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] if the query/variables pair cannot be
    /// serialized.
    pub fn new(
        query: &str,
        variables: &Value,
        authorization: Headers,
    ) -> Result<Self, FrameError> {
        let data = serde_json::to_string(&serde_json::json!({
            "query": query,
            "variables": variables,
        }))
        .map_err(|e| FrameError::Encode(e.to_string()))?;

        Ok(Self {
            data,
            extensions: StartExtensions { authorization },
        })
    }
}

// =============================================================================
// Inbound Frames (Server -> Client)
// =============================================================================

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    ConnectionAck {
        /// Keep-alive parameters advertised by the server.
        #[serde(default)]
        payload: ConnectionAckPayload,
    },

    /// Keep-alive heartbeat.
    Ka,

    /// Subscription accepted.
    StartAck {
        /// Correlation id of the acknowledged subscription.
        id: String,
    },

    /// Subscription event.
    Data {
        /// Correlation id of the target subscription.
        id: String,
        /// Opaque event payload.
        #[serde(default)]
        payload: Value,
    },

    /// Subscription ended normally.
    Complete {
        /// Correlation id of the finished subscription.
        id: String,
    },

    /// Error frame. Without an id it is fatal to the connection; with an id
    /// it concerns a single subscription.
    Error {
        /// Correlation id, absent for connection-level errors.
        #[serde(default)]
        id: Option<String>,
        /// Opaque error payload.
        #[serde(default)]
        payload: Value,
    },

    /// Any frame type this client does not understand.
    #[serde(other)]
    Unknown,
}

/// Payload of a `connection_ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ConnectionAckPayload {
    /// Keep-alive interval in milliseconds. If no `ka` frame arrives within
    /// this window the connection is considered expired.
    #[serde(
        rename = "connectionTimeoutMs",
        default = "default_connection_timeout_ms"
    )]
    pub connection_timeout_ms: u64,
}

impl Default for ConnectionAckPayload {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

const fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_MS
}

impl ServerFrame {
    /// Correlation id for subscription-scoped frames.
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::StartAck { id } | Self::Data { id, .. } | Self::Complete { id } => {
                Some(id.as_str())
            }
            Self::Error { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encode an outbound frame to JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode(frame: &ClientFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|e| FrameError::Encode(e.to_string()))
}

/// Decode inbound JSON text into a server frame.
///
/// # Errors
///
/// Returns [`FrameError::Decode`] if the text is not a valid protocol frame.
pub fn decode(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(|e| FrameError::Decode(e.to_string()))
}
