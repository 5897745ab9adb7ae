//! Authorization Provider Port
//!
//! The client never mints credentials itself. It asks an
//! [`AuthorizationProvider`] for a set of headers once per connection attempt
//! (purpose [`AuthPurpose::Connect`]) and once per subscription attempt
//! (purpose [`AuthPurpose::Subscribe`], with the query and variables the
//! headers must cover). Providers may be asynchronous — an IAM signer, a
//! token refresher — and may fail.
//!
//! Connect-time headers are embedded in the realtime URL; subscribe-time
//! headers travel inside the `start` frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Authorization headers as an arbitrary JSON object.
pub type Headers = serde_json::Map<String, Value>;

/// Why headers are being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPurpose {
    /// Headers for establishing the shared connection.
    Connect,
    /// Headers for starting one subscription.
    Subscribe,
}

/// Context handed to a provider for one authorization request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// What the headers will be used for.
    pub purpose: AuthPurpose,
    /// Query document, present for subscribe requests.
    pub query: Option<String>,
    /// Query variables, present for subscribe requests.
    pub variables: Option<Value>,
}

impl AuthContext {
    /// Context for a connection attempt. Carries no subscription data.
    #[must_use]
    pub const fn connect() -> Self {
        Self {
            purpose: AuthPurpose::Connect,
            query: None,
            variables: None,
        }
    }

    /// Context for a subscription start attempt.
    #[must_use]
    pub fn subscribe(query: &str, variables: &Value) -> Self {
        Self {
            purpose: AuthPurpose::Subscribe,
            query: Some(query.to_string()),
            variables: Some(variables.clone()),
        }
    }
}

/// Error returned by an authorization provider.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AuthError(String);

impl AuthError {
    /// Create an error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Produces authorization headers on demand.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Resolve headers for the given context.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if headers cannot be produced; the requesting
    /// attempt fails and is subject to its retry policy.
    async fn authorize(&self, context: &AuthContext) -> Result<Headers, AuthError>;
}

// =============================================================================
// Provider Implementations
// =============================================================================

/// Provider returning the same headers for every request, e.g. an API key.
#[derive(Debug, Clone)]
pub struct StaticAuthorization {
    headers: Headers,
}

impl StaticAuthorization {
    /// Create a provider from fixed headers.
    #[must_use]
    pub const fn new(headers: Headers) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl AuthorizationProvider for StaticAuthorization {
    async fn authorize(&self, _context: &AuthContext) -> Result<Headers, AuthError> {
        Ok(self.headers.clone())
    }
}

type BoxedAuthFuture = Pin<Box<dyn Future<Output = Result<Headers, AuthError>> + Send>>;

/// Provider backed by a closure, for callers that derive headers per request.
#[derive(Clone)]
pub struct FnAuthorization {
    f: Arc<dyn Fn(AuthContext) -> BoxedAuthFuture + Send + Sync>,
}

impl FnAuthorization {
    /// Wrap an async closure as a provider.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(AuthContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Headers, AuthError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

impl std::fmt::Debug for FnAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAuthorization").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthorizationProvider for FnAuthorization {
    async fn authorize(&self, context: &AuthContext) -> Result<Headers, AuthError> {
        (self.f)(context.clone()).await
    }
}
