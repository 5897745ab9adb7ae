//! Realtime Client
//!
//! Public entry point. One [`RealtimeClient`] owns one shared connection
//! slot; every subscription created through it multiplexes over that
//! connection.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthorizationProvider;
use crate::backoff::RetryConfig;
use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;
use crate::persistent::PersistentSubscriptionBuilder;
use crate::subscription::SubscriptionBuilder;
use crate::transport::{Connector, WebSocketConnector};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base `https://` GraphQL API endpoint; the realtime endpoint is
    /// derived from it.
    pub endpoint: String,
    /// Retry policy for connection establishment.
    pub connection_retry: RetryConfig,
}

impl ClientConfig {
    /// Create a configuration with default connection retry settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection_retry: RetryConfig::default(),
        }
    }

    /// Override the connection retry policy.
    #[must_use]
    pub fn with_connection_retry(mut self, retry: RetryConfig) -> Self {
        self.connection_retry = retry;
        self
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Required
    /// - `APPSYNC_API_URL`: base GraphQL API endpoint
    ///
    /// ## Optional
    /// - `APPSYNC_CONNECT_BASE_MS`: backoff base delay (default: 10)
    /// - `APPSYNC_CONNECT_CAP_MS`: backoff cap (default: 2000)
    /// - `APPSYNC_CONNECT_TIMEOUT_MS`: per-attempt timeout (default: 5000)
    /// - `APPSYNC_CONNECT_MAX_ATTEMPTS`: total attempts (default: 5)
    ///
    /// # Errors
    ///
    /// Returns an error if `APPSYNC_API_URL` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("APPSYNC_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("APPSYNC_API_URL".to_string()))?;
        if endpoint.is_empty() {
            return Err(ConfigError::EmptyValue("APPSYNC_API_URL".to_string()));
        }

        let defaults = RetryConfig::default();
        let connection_retry = RetryConfig {
            base: parse_env_duration_millis("APPSYNC_CONNECT_BASE_MS", defaults.base),
            cap: parse_env_duration_millis("APPSYNC_CONNECT_CAP_MS", defaults.cap),
            attempt_timeout: parse_env_duration_millis(
                "APPSYNC_CONNECT_TIMEOUT_MS",
                defaults.attempt_timeout,
            ),
            max_attempts: parse_env_u32("APPSYNC_CONNECT_MAX_ATTEMPTS", defaults.max_attempts),
        };

        Ok(Self {
            endpoint,
            connection_retry,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

/// Realtime subscription client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use appsync_realtime::{
///     ClientConfig, Headers, RealtimeClient, StaticAuthorization,
/// };
/// use futures_util::StreamExt;
///
/// # async fn example() {
/// let client = RealtimeClient::new(ClientConfig::new(
///     "https://example1234567890123456.appsync-api.us-east-1.amazonaws.com/graphql",
/// ));
///
/// let mut headers = Headers::new();
/// headers.insert("x-api-key".to_string(), "da2-...".into());
///
/// let mut stream = client
///     .subscription(Arc::new(StaticAuthorization::new(headers)))
///     .subscribe("subscription MySubscription { door { open } }", serde_json::json!({}));
///
/// while let Some(event) = stream.next().await {
///     println!("{event:?}");
/// }
/// # }
/// ```
pub struct RealtimeClient {
    manager: Arc<ConnectionManager>,
}

impl RealtimeClient {
    /// Create a client using the production WebSocket transport.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Create a client with a custom transport, e.g. an in-memory socket
    /// for tests.
    #[must_use]
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(
                Endpoint::new(config.endpoint),
                config.connection_retry,
                connector,
            )),
        }
    }

    /// Begin building a subscription authorized by the given provider.
    #[must_use]
    pub fn subscription(&self, provider: Arc<dyn AuthorizationProvider>) -> SubscriptionBuilder {
        SubscriptionBuilder::new(Arc::clone(&self.manager), provider)
    }

    /// Begin building a persistent (auto-reopening) subscription.
    #[must_use]
    pub fn persistent_subscription(
        &self,
        provider: Arc<dyn AuthorizationProvider>,
    ) -> PersistentSubscriptionBuilder {
        PersistentSubscriptionBuilder::new(Arc::clone(&self.manager), provider)
    }
}
