//! Shared Connection Manager
//!
//! Owns the single WebSocket connection a client multiplexes its
//! subscriptions over. The connection is a ref-counted resource:
//! [`ConnectionManager::acquire`] hands out handles, the last released
//! handle tears the socket down, and the next acquire after teardown always
//! dials a fresh connection.
//!
//! A spawned driver task is the only writer of socket state. It performs the
//! handshake (with timeout and backoff across attempts, each attempt on a
//! brand-new socket), arms the keep-alive watchdog advertised by the
//! server's `connection_ack`, routes id-carrying frames to registered
//! subscriptions, and broadcasts its lifecycle phase through a watch
//! channel.
//!
//! Connect-time authorization is last-request-wins: each attempt resolves
//! headers from whichever provider was supplied most recently by any
//! subscription that asked for the shared connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthContext, AuthorizationProvider};
use crate::backoff::{RetryConfig, RetryPolicy};
use crate::endpoint::Endpoint;
use crate::error::RealtimeError;
use crate::frames::{self, ClientFrame, ServerFrame};
use crate::metrics::{
    ACTIVE_SUBSCRIPTIONS, CONNECT_ATTEMPTS, CONNECT_FAILURES, KEEPALIVE_EXPIRIES,
};
use crate::transport::{Connector, SocketSink, SocketSource};

// =============================================================================
// Lifecycle Phase
// =============================================================================

/// Externally observable lifecycle of the shared connection.
#[derive(Debug, Clone)]
pub(crate) enum ConnectionPhase {
    /// Handshake in progress (covers retries).
    Connecting,
    /// Handshake acknowledged; frames flow.
    Open,
    /// Connection is gone. `None` is a graceful end (keep-alive expiry,
    /// remote close, released refs); `Some` carries the failure every
    /// dependent subscription observes.
    Closed(Option<RealtimeError>),
}

// =============================================================================
// Shared Connection State
// =============================================================================

/// State shared between the driver task, the manager and subscriptions.
pub(crate) struct ConnectionShared {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<ServerFrame>>>,
    phase: watch::Sender<ConnectionPhase>,
}

impl ConnectionShared {
    /// Whether the connection can no longer serve new subscribers.
    pub(crate) fn is_terminal(&self) -> bool {
        self.cancel.is_cancelled()
            || matches!(*self.phase.borrow(), ConnectionPhase::Closed(_))
    }

    /// Whether frames currently flow.
    pub(crate) fn is_open(&self) -> bool {
        matches!(*self.phase.borrow(), ConnectionPhase::Open)
    }

    /// Subscribe to lifecycle transitions.
    pub(crate) fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }

    /// Route frames carrying `id` to the given channel.
    pub(crate) fn register(&self, id: &str, tx: mpsc::UnboundedSender<ServerFrame>) {
        self.routes.lock().insert(id.to_string(), tx);
        gauge!(ACTIVE_SUBSCRIPTIONS).increment(1.0);
    }

    /// Remove the route for `id`, if still present.
    pub(crate) fn unregister(&self, id: &str) {
        if self.routes.lock().remove(id).is_some() {
            gauge!(ACTIVE_SUBSCRIPTIONS).decrement(1.0);
        }
    }

    /// Enqueue a frame for the socket. Returns `false` if the driver is
    /// gone; callers treat that as the connection being torn down.
    pub(crate) fn send(&self, frame: ClientFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    fn terminal_phase(&self) -> Option<Option<RealtimeError>> {
        match &*self.phase.borrow() {
            ConnectionPhase::Closed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Error carried by the terminal phase, if the connection failed.
    pub(crate) fn terminal_error(&self) -> Option<RealtimeError> {
        self.terminal_phase().flatten()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

struct ManagerState {
    current: Option<Arc<ConnectionShared>>,
    refs: usize,
}

/// Ref-counted owner of the shared connection.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    retry: RetryConfig,
    provider: Mutex<Option<Arc<dyn AuthorizationProvider>>>,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub(crate) fn new(
        endpoint: Endpoint,
        retry: RetryConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            retry,
            provider: Mutex::new(None),
            state: Mutex::new(ManagerState {
                current: None,
                refs: 0,
            }),
        }
    }

    /// Register interest in the shared connection, creating it if no live
    /// one exists. The supplied provider becomes the connect-time provider
    /// for the next handshake attempt (last request wins).
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        provider: Arc<dyn AuthorizationProvider>,
    ) -> ConnectionHandle {
        *self.provider.lock() = Some(provider);

        let mut state = self.state.lock();
        let conn = match &state.current {
            Some(conn) if !conn.is_terminal() => Arc::clone(conn),
            _ => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (phase_tx, _) = watch::channel(ConnectionPhase::Connecting);
                let conn = Arc::new(ConnectionShared {
                    cancel: CancellationToken::new(),
                    outbound: outbound_tx,
                    routes: Mutex::new(HashMap::new()),
                    phase: phase_tx,
                });
                state.current = Some(Arc::clone(&conn));
                state.refs = 0;

                let driver = ConnectionDriver {
                    manager: Arc::clone(self),
                    conn: Arc::clone(&conn),
                };
                tokio::spawn(driver.run(outbound_rx));
                conn
            }
        };
        state.refs += 1;

        ConnectionHandle {
            manager: Arc::clone(self),
            conn,
        }
    }

    /// Provider most recently supplied by any acquirer.
    fn current_provider(&self) -> Option<Arc<dyn AuthorizationProvider>> {
        self.provider.lock().clone()
    }

    /// Drop the given connection from the manager if it is still current.
    fn clear_current(&self, conn: &Arc<ConnectionShared>) {
        let mut state = self.state.lock();
        if let Some(current) = &state.current
            && Arc::ptr_eq(current, conn)
        {
            state.current = None;
            state.refs = 0;
        }
    }

    fn release(&self, conn: &Arc<ConnectionShared>) {
        let mut state = self.state.lock();
        let Some(current) = &state.current else {
            return;
        };
        if !Arc::ptr_eq(current, conn) {
            // A handle of an already-replaced connection; its teardown
            // happened when the connection went terminal.
            return;
        }
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            tracing::debug!("last subscriber released, closing connection");
            conn.cancel.cancel();
            state.current = None;
        }
    }
}

/// Handle keeping the shared connection alive. Dropping it releases the
/// reference synchronously; the last release closes the socket.
pub(crate) struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
    conn: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub(crate) fn connection(&self) -> &Arc<ConnectionShared> {
        &self.conn
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.manager.release(&self.conn);
    }
}

// =============================================================================
// Connection Driver
// =============================================================================

enum Establish {
    Open {
        sink: SocketSink,
        source: SocketSource,
        keepalive: Duration,
    },
    Failed(RealtimeError),
    Cancelled,
}

struct ConnectionDriver {
    manager: Arc<ConnectionManager>,
    conn: Arc<ConnectionShared>,
}

impl ConnectionDriver {
    async fn run(self, mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>) {
        match self.establish().await {
            Establish::Open {
                sink,
                source,
                keepalive,
            } => self.serve(sink, source, keepalive, &mut outbound_rx).await,
            Establish::Failed(err) => {
                tracing::warn!(error = %err, "connection attempts exhausted");
                self.finish(Some(err));
            }
            Establish::Cancelled => self.finish(None),
        }
    }

    /// Dial until acknowledged, cancelled, or out of attempts. Every attempt
    /// runs on a fresh socket under the configured attempt timeout.
    async fn establish(&self) -> Establish {
        let mut policy = RetryPolicy::new(self.manager.retry.clone());

        loop {
            counter!(CONNECT_ATTEMPTS).increment(1);
            let attempt = tokio::select! {
                () = self.conn.cancel.cancelled() => return Establish::Cancelled,
                outcome = time::timeout(
                    self.manager.retry.attempt_timeout,
                    self.attempt(),
                ) => outcome.unwrap_or(Err(RealtimeError::HandshakeTimeout)),
            };

            let err = match attempt {
                Ok((sink, source, keepalive)) => {
                    return Establish::Open {
                        sink,
                        source,
                        keepalive,
                    };
                }
                Err(err) => err,
            };

            counter!(CONNECT_FAILURES).increment(1);
            match policy.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        attempt = policy.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    tokio::select! {
                        () = self.conn.cancel.cancelled() => return Establish::Cancelled,
                        () = time::sleep(delay) => {}
                    }
                }
                None => return Establish::Failed(err),
            }
        }
    }

    /// One handshake attempt: resolve connect headers from the current
    /// provider, dial, send `connection_init`, await `connection_ack`.
    async fn attempt(&self) -> Result<(SocketSink, SocketSource, Duration), RealtimeError> {
        let provider = self
            .manager
            .current_provider()
            .ok_or_else(|| RealtimeError::Auth("no authorization provider".to_string()))?;
        let headers = provider
            .authorize(&AuthContext::connect())
            .await
            .map_err(|e| RealtimeError::Auth(e.to_string()))?;

        let url = self.manager.endpoint.connection_url(&headers)?;
        tracing::debug!(url = %url, "opening realtime socket");
        let (mut sink, mut source) = self.manager.connector.connect(&url).await?;

        sink.send(frames::encode(&ClientFrame::ConnectionInit)?)
            .await?;

        loop {
            match source.next().await {
                Some(Ok(text)) => match frames::decode(&text)? {
                    ServerFrame::ConnectionAck { payload } => {
                        tracing::info!(
                            keepalive_ms = payload.connection_timeout_ms,
                            "connection acknowledged"
                        );
                        return Ok((
                            sink,
                            source,
                            Duration::from_millis(payload.connection_timeout_ms),
                        ));
                    }
                    ServerFrame::Error { id: None, payload } => {
                        return Err(RealtimeError::Connection { payload });
                    }
                    // ka or stray id-carrying frames before the ack carry no
                    // information for the handshake.
                    _ => {}
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Err(RealtimeError::ConnectionClosed),
            }
        }
    }

    /// Serve the open connection until it ends: pump outbound frames, route
    /// inbound frames by id, and supervise the keep-alive watchdog.
    async fn serve(
        &self,
        mut sink: SocketSink,
        mut source: SocketSource,
        keepalive: Duration,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ) {
        self.conn.phase.send_replace(ConnectionPhase::Open);

        // One full keep-alive window of grace before the first check.
        let watchdog = time::sleep(keepalive);
        tokio::pin!(watchdog);

        let outcome: Option<RealtimeError> = loop {
            tokio::select! {
                () = self.conn.cancel.cancelled() => {
                    // Frames enqueued ahead of the cancellation (a cancelling
                    // subscription's stop frame) still go out before the
                    // socket closes.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if let Ok(text) = frames::encode(&frame) {
                            let _ = sink.send(text).await;
                        }
                    }
                    break None;
                }
                () = watchdog.as_mut() => {
                    tracing::info!(
                        keepalive_ms = keepalive.as_millis() as u64,
                        "keep-alive window elapsed, closing connection"
                    );
                    counter!(KEEPALIVE_EXPIRIES).increment(1);
                    break None;
                }
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break None };
                    let text = match frames::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => break Some(e.into()),
                    };
                    if let Err(e) = sink.send(text).await {
                        break Some(e.into());
                    }
                }
                message = source.next() => match message {
                    Some(Ok(text)) => match frames::decode(&text) {
                        Ok(ServerFrame::Ka) => {
                            watchdog.as_mut().reset(Instant::now() + keepalive);
                        }
                        Ok(ServerFrame::Error { id: None, payload }) => {
                            break Some(RealtimeError::Connection { payload });
                        }
                        Ok(frame) => self.route(frame),
                        Err(e) => break Some(e.into()),
                    },
                    Some(Err(e)) => break Some(e.into()),
                    None => break None,
                },
            }
        };

        let _ = sink.close().await;
        self.finish(outcome);
    }

    fn route(&self, frame: ServerFrame) {
        let Some(id) = frame.subscription_id().map(str::to_owned) else {
            tracing::trace!("ignoring unroutable frame");
            return;
        };
        // Receiver may be gone mid-teardown; the failed send is fine.
        let routed = self
            .conn
            .routes
            .lock()
            .get(&id)
            .map(|tx| tx.send(frame));
        if routed.is_none() {
            tracing::trace!(id, "frame for unknown subscription id");
        }
    }

    /// Publish the terminal phase, then drop all routes so every registered
    /// subscription observes end-of-channel after draining.
    fn finish(&self, error: Option<RealtimeError>) {
        self.conn
            .phase
            .send_replace(ConnectionPhase::Closed(error));
        self.conn.routes.lock().clear();
        self.manager.clear_current(&self.conn);
    }
}
