//! In-Memory Test Harness
//!
//! A scripted realtime server speaking the wire protocol over channel-backed
//! sockets, injected into the client through its [`Connector`] seam.
//! Connections and subscriptions are indexed in arrival order; frames can be
//! queued for connections or subscriptions that do not exist yet and are
//! flushed once the target is ready, so tests read as linear scripts.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt as _;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use appsync_realtime::{
    AuthContext, AuthPurpose, ClientConfig, Connector, FnAuthorization, Headers, RealtimeClient,
    RetryConfig, SocketSink, SocketSource, StaticAuthorization, TransportError,
};

/// How long any single wait may take before the test is declared hung.
const WAIT_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Server Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reply to `connection_init` with `connection_ack` automatically.
    pub auto_ack_connection: bool,
    /// Reply to `start` with `start_ack` automatically.
    pub auto_ack_subscription: bool,
    /// Keep-alive interval advertised by automatic acks.
    pub connection_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auto_ack_connection: true,
            auto_ack_subscription: true,
            connection_timeout_ms: 10_000,
        }
    }
}

// =============================================================================
// Server State
// =============================================================================

struct SubscriptionRecord {
    id: String,
    payload: Value,
    acked: bool,
    pending: Vec<Value>,
}

struct ConnectionRecord {
    url: String,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    inited: bool,
    acked: bool,
    client_closed: bool,
    pending: Vec<Value>,
    subscriptions: Vec<SubscriptionRecord>,
    stops: Vec<String>,
}

impl ConnectionRecord {
    fn raw_send(&self, frame: &Value) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(frame.to_string()));
        }
    }

    fn ready(&self, config: &ServerConfig) -> bool {
        !config.auto_ack_connection || self.acked
    }
}

#[derive(Default)]
struct ServerState {
    connections: Vec<ConnectionRecord>,
    /// Frames queued for connections that have not dialed in yet.
    early: Vec<(usize, Value)>,
    /// Frames queued for subscriptions that have not started yet.
    early_subs: Vec<(usize, usize, Value)>,
}

// =============================================================================
// Test Server
// =============================================================================

#[derive(Clone)]
pub struct TestServer {
    config: ServerConfig,
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
}

impl TestServer {
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn subscription_count(&self, connection: usize) -> usize {
        self.state
            .lock()
            .connections
            .get(connection)
            .map_or(0, |c| c.subscriptions.len())
    }

    /// URL the client dialed for the given connection.
    pub fn connection_url(&self, connection: usize) -> String {
        self.state.lock().connections[connection].url.clone()
    }

    /// `header` query parameter of the dialed URL, base64-decoded.
    pub fn connection_header(&self, connection: usize) -> Value {
        let url = self.connection_url(connection);
        let header =
            raw_query_param(&url, "header").expect("connection url carries a header parameter");
        serde_json::from_slice(&BASE64.decode(header).unwrap()).unwrap()
    }

    /// `payload` query parameter of the dialed URL, base64-decoded.
    pub fn connection_payload(&self, connection: usize) -> String {
        let url = self.connection_url(connection);
        let payload =
            raw_query_param(&url, "payload").expect("connection url carries a payload parameter");
        String::from_utf8(BASE64.decode(payload).unwrap()).unwrap()
    }

    /// Payload of the `start` frame for the given subscription.
    pub fn start_payload(&self, connection: usize, subscription: usize) -> Value {
        self.state.lock().connections[connection].subscriptions[subscription]
            .payload
            .clone()
    }

    /// Correlation id of the given subscription's start frame.
    pub fn subscription_id(&self, connection: usize, subscription: usize) -> String {
        self.state.lock().connections[connection].subscriptions[subscription]
            .id
            .clone()
    }

    /// Ids of `stop` frames received on the given connection.
    pub fn stops(&self, connection: usize) -> Vec<String> {
        self.state
            .lock()
            .connections
            .get(connection)
            .map_or_else(Vec::new, |c| c.stops.clone())
    }

    pub fn is_connection_closed(&self, connection: usize) -> bool {
        self.state
            .lock()
            .connections
            .get(connection)
            .is_some_and(|c| c.client_closed)
    }

    /// Queue or deliver a connection-scoped frame. Frames queue until the
    /// target connection exists and (with auto-ack enabled) is acked.
    pub fn send_to_connection(&self, connection: usize, frame: Value) {
        let mut state = self.state.lock();
        match state.connections.get_mut(connection) {
            Some(conn) if conn.ready(&self.config) => conn.raw_send(&frame),
            Some(conn) => conn.pending.push(frame),
            None => state.early.push((connection, frame)),
        }
        self.notify.notify_waiters();
    }

    /// Queue or deliver a subscription-scoped frame; the subscription's id
    /// is attached on delivery.
    pub fn send_to_subscription(&self, connection: usize, subscription: usize, frame: Value) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(connection) else {
            state.early_subs.push((connection, subscription, frame));
            return;
        };
        match conn.subscriptions.get_mut(subscription) {
            Some(sub) if sub.acked || !self.config.auto_ack_subscription => {
                let framed = attach_id(&frame, &sub.id);
                conn.raw_send(&framed);
            }
            Some(sub) => sub.pending.push(frame),
            None => state.early_subs.push((connection, subscription, frame)),
        }
        self.notify.notify_waiters();
    }

    /// Server-side close of the given connection's socket.
    pub fn close_connection(&self, connection: usize) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.get_mut(connection) {
            conn.to_client = None;
        }
        self.notify.notify_waiters();
    }

    pub async fn wait_for_connection(&self, connection: usize) {
        self.wait_until(move |state| {
            state
                .connections
                .get(connection)
                .is_some_and(|c| c.inited)
        })
        .await;
    }

    pub async fn wait_for_subscription(&self, connection: usize, subscription: usize) {
        self.wait_until(move |state| {
            state
                .connections
                .get(connection)
                .is_some_and(|c| c.subscriptions.len() > subscription)
        })
        .await;
    }

    pub async fn wait_for_connection_closed(&self, connection: usize) {
        self.wait_until(move |state| {
            state
                .connections
                .get(connection)
                .is_some_and(|c| c.client_closed)
        })
        .await;
    }

    pub async fn wait_for_stop(&self, connection: usize) {
        self.wait_until(move |state| {
            state
                .connections
                .get(connection)
                .is_some_and(|c| !c.stops.is_empty())
        })
        .await;
    }

    async fn wait_until(&self, predicate: impl Fn(&ServerState) -> bool) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if predicate(&self.state.lock()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(WAIT_DEADLINE, wait)
            .await
            .expect("test server wait timed out");
    }
}

/// Extract a query parameter without form-urlencoded decoding; base64
/// values must come back byte-for-byte.
fn raw_query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn attach_id(frame: &Value, id: &str) -> Value {
    let mut framed = frame.clone();
    if let Some(obj) = framed.as_object_mut() {
        obj.insert("id".to_string(), Value::from(id));
    }
    framed
}

// =============================================================================
// Channel Socket Halves
// =============================================================================

/// Client-side outbound half over a tokio channel.
struct ChannelSink(Option<mpsc::UnboundedSender<String>>);

impl futures_util::Sink<String> for ChannelSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
        self.0
            .as_ref()
            .ok_or_else(|| TransportError::Send("socket closed".to_string()))?
            .send(item)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.take();
        Poll::Ready(Ok(()))
    }
}

/// Client-side inbound half over a tokio channel.
struct ChannelSource(mpsc::UnboundedReceiver<Result<String, TransportError>>);

impl futures_util::Stream for ChannelSource {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

// =============================================================================
// Channel Connector
// =============================================================================

struct ChannelConnector {
    config: ServerConfig,
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<(SocketSink, SocketSource), TransportError> {
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel::<String>();
        let (to_client_tx, to_client_rx) =
            mpsc::unbounded_channel::<Result<String, TransportError>>();

        let index = {
            let mut state = self.state.lock();
            let mut conn = ConnectionRecord {
                url: url.to_string(),
                to_client: Some(to_client_tx),
                inited: false,
                acked: false,
                client_closed: false,
                pending: Vec::new(),
                subscriptions: Vec::new(),
                stops: Vec::new(),
            };
            let index = state.connections.len();

            // Adopt frames queued for this connection before it dialed in.
            let early: Vec<Value> = {
                let mut kept = Vec::new();
                let mut adopted = Vec::new();
                for (target, frame) in state.early.drain(..) {
                    if target == index {
                        adopted.push(frame);
                    } else {
                        kept.push((target, frame));
                    }
                }
                state.early = kept;
                adopted
            };
            if self.config.auto_ack_connection {
                conn.pending.extend(early);
            } else {
                for frame in &early {
                    conn.raw_send(frame);
                }
            }

            state.connections.push(conn);
            index
        };
        self.notify.notify_waiters();

        tokio::spawn(serve_connection(
            self.config.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.notify),
            index,
            to_server_rx,
        ));

        let sink: SocketSink = Box::pin(ChannelSink(Some(to_server_tx)));
        let source: SocketSource = Box::pin(ChannelSource(to_client_rx));
        Ok((sink, source))
    }
}

/// Per-connection server loop: reads client frames, applies auto-acks and
/// queue flushing, records starts and stops.
async fn serve_connection(
    config: ServerConfig,
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
    index: usize,
    mut from_client: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = from_client.recv().await {
        let frame: Value = serde_json::from_str(&text).expect("client sent valid JSON");
        let frame_type = frame["type"].as_str().unwrap_or_default().to_string();

        let mut locked = state.lock();
        match frame_type.as_str() {
            "connection_init" => {
                let conn = &mut locked.connections[index];
                conn.inited = true;
                if config.auto_ack_connection {
                    conn.raw_send(&json!({
                        "type": "connection_ack",
                        "payload": {"connectionTimeoutMs": config.connection_timeout_ms},
                    }));
                    conn.acked = true;
                    let pending = std::mem::take(&mut conn.pending);
                    for queued in &pending {
                        conn.raw_send(queued);
                    }
                }
            }
            "start" => {
                let subscription = {
                    let conn = &mut locked.connections[index];
                    conn.subscriptions.push(SubscriptionRecord {
                        id: frame["id"].as_str().unwrap_or_default().to_string(),
                        payload: frame["payload"].clone(),
                        acked: false,
                        pending: Vec::new(),
                    });
                    conn.subscriptions.len() - 1
                };

                // Adopt frames queued for this subscription slot.
                let early: Vec<Value> = {
                    let mut kept = Vec::new();
                    let mut adopted = Vec::new();
                    for (conn_target, sub_target, queued) in locked.early_subs.drain(..) {
                        if conn_target == index && sub_target == subscription {
                            adopted.push(queued);
                        } else {
                            kept.push((conn_target, sub_target, queued));
                        }
                    }
                    locked.early_subs = kept;
                    adopted
                };

                let conn = &mut locked.connections[index];
                let sub = &mut conn.subscriptions[subscription];
                sub.pending.extend(early);
                if config.auto_ack_subscription {
                    let id = sub.id.clone();
                    let pending = std::mem::take(&mut sub.pending);
                    sub.acked = true;
                    conn.raw_send(&json!({"type": "start_ack", "id": id}));
                    for queued in &pending {
                        conn.raw_send(&attach_id(queued, &id));
                    }
                } else {
                    let id = sub.id.clone();
                    let pending = std::mem::take(&mut sub.pending);
                    for queued in &pending {
                        conn.raw_send(&attach_id(queued, &id));
                    }
                }
            }
            "stop" => {
                let conn = &mut locked.connections[index];
                conn.stops
                    .push(frame["id"].as_str().unwrap_or_default().to_string());
            }
            _ => {}
        }
        drop(locked);
        notify.notify_waiters();
    }

    state.lock().connections[index].client_closed = true;
    notify.notify_waiters();
}

// =============================================================================
// Harness Entry Points
// =============================================================================

pub struct TestHarness {
    pub client: RealtimeClient,
    pub server: TestServer,
}

/// Build a client wired to an in-memory server.
pub fn setup(server_config: ServerConfig, connection_retry: RetryConfig) -> TestHarness {
    let state = Arc::new(Mutex::new(ServerState::default()));
    let notify = Arc::new(Notify::new());

    let connector = ChannelConnector {
        config: server_config.clone(),
        state: Arc::clone(&state),
        notify: Arc::clone(&notify),
    };

    let client_config = ClientConfig::new("https://127.0.0.1:8443")
        .with_connection_retry(connection_retry);
    let client = RealtimeClient::with_connector(client_config, Arc::new(connector));

    TestHarness {
        client,
        server: TestServer {
            config: server_config,
            state,
            notify,
        },
    }
}

pub fn default_setup() -> TestHarness {
    setup(ServerConfig::default(), RetryConfig::default())
}

// =============================================================================
// Providers
// =============================================================================

/// Provider returning a fixed header object.
pub fn static_provider(headers: Value) -> Arc<StaticAuthorization> {
    let map = headers
        .as_object()
        .cloned()
        .unwrap_or_else(Headers::new);
    Arc::new(StaticAuthorization::new(map))
}

/// Provider returning empty headers.
pub fn null_provider() -> Arc<StaticAuthorization> {
    Arc::new(StaticAuthorization::new(Headers::new()))
}

/// Provider echoing its context, mirroring the shape asserted by the
/// original test suite: `{test: <tag>, connect: <bool>, data: <context>}`.
pub fn echo_provider(tag: &str) -> Arc<FnAuthorization> {
    let tag = tag.to_string();
    Arc::new(FnAuthorization::new(move |ctx: AuthContext| {
        let tag = tag.clone();
        async move {
            let mut headers = Headers::new();
            headers.insert("test".to_string(), Value::from(tag));
            headers.insert(
                "connect".to_string(),
                Value::from(ctx.purpose == AuthPurpose::Connect),
            );
            let data = match ctx.purpose {
                AuthPurpose::Connect => json!({}),
                AuthPurpose::Subscribe => json!({
                    "query": ctx.query,
                    "variables": ctx.variables,
                }),
            };
            headers.insert("data".to_string(), data);
            Ok(headers)
        }
    }))
}

/// Provider that resolves after a delay, for cancellation-window tests.
/// `connect_delay`/`subscribe_delay` apply per purpose.
pub fn slow_provider(
    connect_delay: Duration,
    subscribe_delay: Duration,
) -> Arc<FnAuthorization> {
    Arc::new(FnAuthorization::new(move |ctx: AuthContext| async move {
        let delay = match ctx.purpose {
            AuthPurpose::Connect => connect_delay,
            AuthPurpose::Subscribe => subscribe_delay,
        };
        tokio::time::sleep(delay).await;
        Ok(Headers::new())
    }))
}

/// The query document used throughout the suite.
pub const QUERY: &str = "subscription MySubscription {\n  singleton {\n    data\n    last_updated\n  }\n}";

/// Drain a subscription stream to its end, failing the test if it hangs.
pub async fn collect_events(
    stream: &mut appsync_realtime::SubscriptionStream,
) -> Vec<Result<Value, appsync_realtime::RealtimeError>> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(WAIT_DEADLINE, stream.next_event())
            .await
            .expect("subscription stream did not terminate");
        match next {
            Some(event) => events.push(event),
            None => return events,
        }
    }
}

/// Receive one item from a stream under the suite deadline.
pub async fn next_with_deadline<T>(
    stream: &mut (impl futures_util::Stream<Item = T> + Unpin),
) -> Option<T> {
    tokio::time::timeout(WAIT_DEADLINE, stream.next())
        .await
        .expect("stream item did not arrive in time")
}
