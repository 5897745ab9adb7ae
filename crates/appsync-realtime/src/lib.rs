#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! AppSync Realtime - GraphQL Subscription Client
//!
//! A client library for the AppSync realtime pub/sub protocol. One client
//! maintains a single WebSocket connection and multiplexes any number of
//! logical GraphQL subscriptions over it, with independent retry-with-backoff
//! at the connection level and at the subscription level.
//!
//! # Architecture
//!
//! ```text
//!                      +--------------------+
//! subscription 1 ----->|                    |
//! subscription 2 ----->| ConnectionManager  |-----> single WebSocket
//! subscription N ----->| (ref-counted)      |       (graphql-ws)
//!                      +--------------------+
//! ```
//!
//! - Subscriptions acquire the shared connection; the first acquisition
//!   dials it, the last release tears it down.
//! - The connection driver performs the `connection_init`/`connection_ack`
//!   handshake, supervises the server-advertised keep-alive window, and
//!   routes id-carrying frames to their subscriptions.
//! - Each subscription negotiates `start`/`start_ack` (fresh correlation id
//!   per attempt) and then streams `data` frames to its caller until
//!   `complete`, an error frame, or cancellation.
//! - Authorization is pluggable: a provider is asked for headers once per
//!   connection attempt and once per subscription attempt.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Authorization provider port.
pub mod auth;

/// Retry policy shared by connection and subscription attempts.
pub mod backoff;

/// Public client entry point and configuration.
pub mod client;

mod connection;

/// Realtime endpoint derivation.
pub mod endpoint;

/// Error taxonomy surfaced to callers.
pub mod error;

/// Wire frame types and codec.
pub mod frames;

/// Metric names emitted through the `metrics` facade.
pub mod metrics;

/// Auto-reopening subscription wrapper.
pub mod persistent;

/// Subscription builder, stream and multiplexing task.
pub mod subscription;

/// Transport socket port and production WebSocket connector.
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{
    AuthContext, AuthError, AuthPurpose, AuthorizationProvider, FnAuthorization, Headers,
    StaticAuthorization,
};
pub use backoff::{RetryConfig, RetryPolicy};
pub use client::{ClientConfig, ConfigError, RealtimeClient};
pub use endpoint::Endpoint;
pub use error::RealtimeError;
pub use frames::{ClientFrame, ConnectionAckPayload, ServerFrame, StartPayload};
pub use persistent::{PersistentSubscriptionBuilder, PersistentSubscriptionStream};
pub use subscription::{SubscriptionBuilder, SubscriptionStream};
pub use transport::{Connector, SocketSink, SocketSource, TransportError, WebSocketConnector};
