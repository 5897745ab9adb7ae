//! Persistent Subscription
//!
//! A long-lived wrapper around [`crate::SubscriptionStream`] for callers
//! that want a subscription to outlive individual connection or
//! subscription failures. When the inner subscription terminates — error,
//! server completion, or keep-alive expiry — the wrapper waits a configured
//! delay and subscribes again from scratch (new connection acquisition, new
//! headers, new correlation id).
//!
//! The `opened`/`closed` hooks fire on every cycle, so UIs can reflect
//! staleness and refetch on reopen.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationProvider;
use crate::backoff::RetryConfig;
use crate::connection::ConnectionManager;
use crate::error::RealtimeError;
use crate::subscription::SubscriptionBuilder;

const DEFAULT_REOPEN_ON_ERROR: Duration = Duration::from_secs(5);
const DEFAULT_REOPEN_ON_COMPLETE: Duration = Duration::from_secs(5);

type SharedOpenedHook = Arc<Mutex<Box<dyn FnMut() + Send>>>;
type PersistentClosedHook = Box<dyn FnMut(Option<&RealtimeError>) + Send>;

/// Configures a persistent subscription before starting it.
pub struct PersistentSubscriptionBuilder {
    manager: Arc<ConnectionManager>,
    provider: Arc<dyn AuthorizationProvider>,
    retry: RetryConfig,
    reopen_on_error: Duration,
    reopen_on_complete: Duration,
    opened: Option<SharedOpenedHook>,
    closed: Option<PersistentClosedHook>,
}

impl PersistentSubscriptionBuilder {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        provider: Arc<dyn AuthorizationProvider>,
    ) -> Self {
        Self {
            manager,
            provider,
            retry: RetryConfig::default(),
            reopen_on_error: DEFAULT_REOPEN_ON_ERROR,
            reopen_on_complete: DEFAULT_REOPEN_ON_COMPLETE,
            opened: None,
            closed: None,
        }
    }

    /// Override the start/ack retry policy used by each cycle.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Delay before reopening after the inner subscription fails.
    #[must_use]
    pub const fn reopen_on_error(mut self, delay: Duration) -> Self {
        self.reopen_on_error = delay;
        self
    }

    /// Delay before reopening after the inner subscription ends normally.
    #[must_use]
    pub const fn reopen_on_complete(mut self, delay: Duration) -> Self {
        self.reopen_on_complete = delay;
        self
    }

    /// Hook invoked every time a cycle's start is acknowledged.
    #[must_use]
    pub fn on_opened(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.opened = Some(Arc::new(Mutex::new(Box::new(hook))));
        self
    }

    /// Hook invoked every time a cycle terminates, with its error if any.
    #[must_use]
    pub fn on_closed(
        mut self,
        hook: impl FnMut(Option<&RealtimeError>) + Send + 'static,
    ) -> Self {
        self.closed = Some(Box::new(hook));
        self
    }

    /// Start the persistent subscription. Must be called from within a
    /// tokio runtime.
    pub fn subscribe(
        self,
        query: impl Into<String>,
        variables: Value,
    ) -> PersistentSubscriptionStream {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = PersistentTask {
            manager: self.manager,
            provider: self.provider,
            retry: self.retry,
            query: query.into(),
            variables,
            reopen_on_error: self.reopen_on_error,
            reopen_on_complete: self.reopen_on_complete,
            opened: self.opened,
            closed: self.closed,
            events: event_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        PersistentSubscriptionStream {
            events: event_rx,
            cancel,
        }
    }
}

/// Stream of data payloads that survives reconnects. Never yields errors;
/// failures show up through the `closed` hook and a reopened cycle.
pub struct PersistentSubscriptionStream {
    events: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
}

impl PersistentSubscriptionStream {
    /// Receive the next data payload.
    pub async fn next_event(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    /// Stop resubscribing and tear down the current cycle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for PersistentSubscriptionStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for PersistentSubscriptionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PersistentTask {
    manager: Arc<ConnectionManager>,
    provider: Arc<dyn AuthorizationProvider>,
    retry: RetryConfig,
    query: String,
    variables: Value,
    reopen_on_error: Duration,
    reopen_on_complete: Duration,
    opened: Option<SharedOpenedHook>,
    closed: Option<PersistentClosedHook>,
    events: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
}

impl PersistentTask {
    async fn run(mut self) {
        loop {
            let mut inner = {
                let mut builder = SubscriptionBuilder::new(
                    Arc::clone(&self.manager),
                    Arc::clone(&self.provider),
                )
                .retry(self.retry.clone());
                if let Some(opened) = &self.opened {
                    let opened = Arc::clone(opened);
                    builder = builder.on_opened(move || {
                        let mut hook = opened.lock();
                        (*hook)();
                    });
                }
                builder.subscribe(self.query.clone(), self.variables.clone())
            };

            let mut terminal_error = None;
            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        inner.cancel();
                        return;
                    }
                    event = inner.next_event() => match event {
                        Some(Ok(payload)) => {
                            if self.events.send(payload).is_err() {
                                inner.cancel();
                                return;
                            }
                        }
                        Some(Err(err)) => terminal_error = Some(err),
                        None => break,
                    }
                }
            }
            drop(inner);

            if let Some(closed) = &mut self.closed {
                closed(terminal_error.as_ref());
            }

            let delay = if terminal_error.is_some() {
                self.reopen_on_error
            } else {
                self.reopen_on_complete
            };
            tracing::debug!(
                delay_ms = delay.as_millis() as u64,
                errored = terminal_error.is_some(),
                "subscription ended, reopening"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = time::sleep(delay) => {}
            }
        }
    }
}
