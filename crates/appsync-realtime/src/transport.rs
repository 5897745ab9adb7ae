//! Transport Socket Port
//!
//! Thin abstraction over the single bidirectional message socket. The
//! connection driver only ever sees a pair of boxed halves — a text-frame
//! sink and a text-frame stream — so tests can substitute an in-memory
//! socket the same way production substitutes a TLS WebSocket.
//!
//! [`WebSocketConnector`] is the production implementation, speaking the
//! `graphql-ws` subprotocol over tokio-tungstenite.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

/// WebSocket subprotocol required by the realtime service.
const SUBPROTOCOL: &str = "graphql-ws";

/// Errors from the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("failed to open socket: {0}")]
    Connect(String),

    /// A frame could not be sent.
    #[error("socket send failed: {0}")]
    Send(String),

    /// The inbound stream failed.
    #[error("socket receive failed: {0}")]
    Receive(String),
}

/// Outbound half of a socket: a sink of text frames.
pub type SocketSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a socket: a stream of text frames, ending when the peer
/// closes.
pub type SocketSource = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens sockets. Each call produces a brand-new socket; failed connections
/// are never reused.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to the given `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the socket cannot be
    /// established.
    async fn connect(&self, url: &str) -> Result<(SocketSink, SocketSource), TransportError>;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(SocketSink, SocketSource), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws.split();

        let sink: SocketSink = Box::pin(
            write
                .with(|text: String| {
                    std::future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                        Message::Text(text.into()),
                    ))
                })
                .sink_map_err(|e| TransportError::Send(e.to_string())),
        );

        let source: SocketSource = Box::pin(read.filter_map(|msg| {
            std::future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                // Binary, ping/pong and close frames are not part of this
                // protocol; the close handshake surfaces as end-of-stream.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        }));

        Ok((sink, source))
    }
}
