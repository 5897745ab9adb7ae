//! Subscription Multiplexer
//!
//! One logical subscription on the shared connection. Each subscription
//! acquires a connection reference, resolves its own authorization headers,
//! negotiates start/start_ack with retry (a fresh correlation id per
//! attempt), and then delivers data frames to the caller in arrival order
//! until the server completes it, errors it, or the caller cancels.
//!
//! Cancellation is immediate with respect to future side effects: dropping
//! (or cancelling) a [`SubscriptionStream`] releases the connection
//! reference synchronously, sends a `stop` frame when a start was
//! acknowledged, and abandons any in-flight header resolution.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthContext, AuthorizationProvider};
use crate::backoff::{RetryConfig, RetryPolicy};
use crate::connection::{ConnectionManager, ConnectionPhase, ConnectionShared};
use crate::error::RealtimeError;
use crate::frames::{ClientFrame, ServerFrame, StartPayload};
use crate::metrics::{DATA_FRAMES, START_ATTEMPTS};

/// Invoked once when the subscription's start is acknowledged.
pub type OpenedHook = Box<dyn FnOnce() + Send>;

/// Invoked once when the subscription terminates; receives the terminal
/// error, if there was one.
pub type ClosedHook = Box<dyn FnOnce(Option<&RealtimeError>) + Send>;

// =============================================================================
// Builder
// =============================================================================

/// Configures one subscription before starting it.
pub struct SubscriptionBuilder {
    manager: Arc<ConnectionManager>,
    provider: Arc<dyn AuthorizationProvider>,
    retry: RetryConfig,
    opened: Option<OpenedHook>,
    closed: Option<ClosedHook>,
}

impl SubscriptionBuilder {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        provider: Arc<dyn AuthorizationProvider>,
    ) -> Self {
        Self {
            manager,
            provider,
            retry: RetryConfig::default(),
            opened: None,
            closed: None,
        }
    }

    /// Override the start/ack retry policy for this subscription.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Hook invoked exactly once when the server acknowledges the start.
    #[must_use]
    pub fn on_opened(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.opened = Some(Box::new(hook));
        self
    }

    /// Hook invoked exactly once when the subscription terminates.
    #[must_use]
    pub fn on_closed(
        mut self,
        hook: impl FnOnce(Option<&RealtimeError>) + Send + 'static,
    ) -> Self {
        self.closed = Some(Box::new(hook));
        self
    }

    /// Start the subscription. Must be called from within a tokio runtime.
    ///
    /// The query document and variables are opaque to the client; they are
    /// forwarded verbatim in the `start` frame and to the authorization
    /// provider.
    pub fn subscribe(self, query: impl Into<String>, variables: Value) -> SubscriptionStream {
        let query = query.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Acquire synchronously so the provider slot and refcount reflect
        // subscribe-call order.
        let handle = self.manager.acquire(Arc::clone(&self.provider));
        let conn = Arc::clone(handle.connection());
        let state = Arc::new(SubscriptionState {
            conn: Arc::clone(&conn),
            acked: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            current_id: Mutex::new(None),
            handle: Mutex::new(Some(handle)),
        });

        let task = SubscriptionTask {
            conn,
            provider: self.provider,
            retry: self.retry,
            query,
            variables,
            opened: self.opened,
            closed: self.closed,
            events: event_tx,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        SubscriptionStream {
            events: event_rx,
            cancel,
            state,
        }
    }
}

// =============================================================================
// Shared Subscription State
// =============================================================================

/// State shared between the caller-facing stream and the background task so
/// cancellation can release resources synchronously.
struct SubscriptionState {
    conn: Arc<ConnectionShared>,
    acked: AtomicBool,
    finished: AtomicBool,
    current_id: Mutex<Option<String>>,
    handle: Mutex<Option<crate::connection::ConnectionHandle>>,
}

impl SubscriptionState {
    /// Drop the connection reference. Idempotent.
    fn release(&self) {
        let handle = self.handle.lock().take();
        drop(handle);
    }

    /// Graceful server-side teardown for an acknowledged subscription.
    fn send_stop_if_acked(&self) {
        if !self.acked.load(Ordering::SeqCst) || !self.conn.is_open() {
            return;
        }
        if let Some(id) = self.current_id.lock().clone() {
            let _ = self.conn.send(ClientFrame::Stop { id });
        }
    }
}

// =============================================================================
// Caller-Facing Stream
// =============================================================================

/// Cancellable stream of subscription events.
///
/// Yields `Ok(payload)` per data frame, in arrival order. A terminal server
/// or connection error yields one `Err` and then the stream ends; normal
/// completion, keep-alive expiry and cancellation end the stream without an
/// error. Dropping the stream cancels the subscription.
pub struct SubscriptionStream {
    events: mpsc::UnboundedReceiver<Result<Value, RealtimeError>>,
    cancel: CancellationToken,
    state: Arc<SubscriptionState>,
}

impl SubscriptionStream {
    /// Receive the next event.
    pub async fn next_event(&mut self) -> Option<Result<Value, RealtimeError>> {
        self.events.recv().await
    }

    /// Cancel the subscription: send `stop` if the start was acknowledged
    /// and release the connection reference. Pending deliveries stop
    /// immediately.
    pub fn cancel(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if !self.state.finished.load(Ordering::SeqCst) {
            self.state.send_stop_if_acked();
        }
        self.state.release();
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<Value, RealtimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Background Task
// =============================================================================

enum Terminal {
    Completed,
    Errored(RealtimeError),
    Cancelled,
}

enum AckOutcome {
    Acked,
    Retry(RealtimeError),
    ConnectionEnded,
}

struct SubscriptionTask {
    conn: Arc<ConnectionShared>,
    provider: Arc<dyn AuthorizationProvider>,
    retry: RetryConfig,
    query: String,
    variables: Value,
    opened: Option<OpenedHook>,
    closed: Option<ClosedHook>,
    events: mpsc::UnboundedSender<Result<Value, RealtimeError>>,
    state: Arc<SubscriptionState>,
    cancel: CancellationToken,
}

impl SubscriptionTask {
    async fn run(mut self) {
        let outcome = self.drive().await;

        self.state.finished.store(true, Ordering::SeqCst);
        if let Some(id) = self.state.current_id.lock().take() {
            self.conn.unregister(&id);
        }
        // Terminal events release the reference themselves; the caller may
        // hold the stream long after the server completed it.
        self.state.release();

        let error = match outcome {
            Terminal::Errored(err) => {
                let _ = self.events.send(Err(err.clone()));
                Some(err)
            }
            Terminal::Completed | Terminal::Cancelled => None,
        };
        if let Some(closed) = self.closed.take() {
            closed(error.as_ref());
        }
    }

    async fn drive(&mut self) -> Terminal {
        // Await the shared connection.
        let mut phase = self.conn.watch_phase();
        loop {
            let snapshot = phase.borrow_and_update().clone();
            match snapshot {
                ConnectionPhase::Open => break,
                ConnectionPhase::Closed(Some(err)) => return Terminal::Errored(err),
                ConnectionPhase::Closed(None) => return Terminal::Completed,
                ConnectionPhase::Connecting => {
                    tokio::select! {
                        () = self.cancel.cancelled() => return Terminal::Cancelled,
                        changed = phase.changed() => {
                            if changed.is_err() {
                                return Terminal::Completed;
                            }
                        }
                    }
                }
            }
        }

        // Resolve subscription-level headers. Cancellation discards the
        // in-flight future; no start frame is ever sent.
        let context = AuthContext::subscribe(&self.query, &self.variables);
        let headers = tokio::select! {
            () = self.cancel.cancelled() => return Terminal::Cancelled,
            resolved = self.provider.authorize(&context) => match resolved {
                Ok(headers) => headers,
                Err(e) => return Terminal::Errored(RealtimeError::Auth(e.to_string())),
            }
        };

        let payload = match StartPayload::new(&self.query, &self.variables, headers) {
            Ok(payload) => payload,
            Err(e) => return Terminal::Errored(e.into()),
        };

        // Start / start_ack with retry. A retried subscription is a new
        // attempt under a new id, never a resend of the same frame.
        let mut policy = RetryPolicy::new(self.retry.clone());
        let mut route_rx = loop {
            let id = Uuid::new_v4().to_string();
            let (route_tx, mut route_rx) = mpsc::unbounded_channel();
            self.conn.register(&id, route_tx);
            *self.state.current_id.lock() = Some(id.clone());

            if self.conn.is_terminal() {
                // The connection died between acquire and start; its fate is
                // ours, with no start attempt consumed.
                self.conn.unregister(&id);
                return self.connection_fate();
            }

            counter!(START_ATTEMPTS).increment(1);
            let _ = self.conn.send(ClientFrame::Start {
                id: id.clone(),
                payload: payload.clone(),
            });

            let ack = tokio::select! {
                () = self.cancel.cancelled() => return Terminal::Cancelled,
                outcome = time::timeout(
                    self.retry.attempt_timeout,
                    Self::await_ack(&mut route_rx),
                ) => outcome,
            };

            let err = match ack {
                Ok(AckOutcome::Acked) => break route_rx,
                Ok(AckOutcome::ConnectionEnded) => return self.connection_fate(),
                Ok(AckOutcome::Retry(err)) => err,
                Err(_elapsed) => RealtimeError::StartTimeout,
            };

            self.conn.unregister(&id);
            *self.state.current_id.lock() = None;

            match policy.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        attempt = policy.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "subscription start failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Terminal::Cancelled,
                        () = time::sleep(delay) => {}
                    }
                }
                None => return Terminal::Errored(err),
            }
        };

        self.state.acked.store(true, Ordering::SeqCst);
        if let Some(opened) = self.opened.take() {
            opened();
        }

        // Streaming: deliver data frames in arrival order until a terminal
        // frame, connection end, or cancellation.
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Terminal::Cancelled,
                frame = route_rx.recv() => match frame {
                    Some(ServerFrame::Data { payload, .. }) => {
                        counter!(DATA_FRAMES).increment(1);
                        if self.events.send(Ok(payload)).is_err() {
                            return Terminal::Cancelled;
                        }
                    }
                    Some(ServerFrame::Complete { .. }) => return Terminal::Completed,
                    Some(ServerFrame::Error { payload, .. }) => {
                        return Terminal::Errored(RealtimeError::Subscription { payload });
                    }
                    Some(_) => {}
                    None => return self.connection_fate(),
                }
            }
        }
    }

    /// How a subscription ends when the shared connection is gone: its
    /// error if it failed, a normal end otherwise.
    fn connection_fate(&self) -> Terminal {
        self.conn
            .terminal_error()
            .map_or(Terminal::Completed, Terminal::Errored)
    }

    async fn await_ack(route_rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> AckOutcome {
        loop {
            match route_rx.recv().await {
                Some(ServerFrame::StartAck { .. }) => return AckOutcome::Acked,
                Some(ServerFrame::Error { payload, .. }) => {
                    return AckOutcome::Retry(RealtimeError::Subscription { payload });
                }
                // Data before the ack is dropped; delivery starts once acked.
                Some(_) => {}
                None => return AckOutcome::ConnectionEnded,
            }
        }
    }
}
