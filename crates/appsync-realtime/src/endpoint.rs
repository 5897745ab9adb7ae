//! Realtime Endpoint Derivation
//!
//! The realtime endpoint is derived from the base GraphQL API endpoint.
//! Standard AppSync domains
//! (`https://<26 chars>.appsync-api.<region>.amazonaws.com/graphql`) swap
//! `appsync-api` for `appsync-realtime-api`; any other endpoint (custom
//! domains, local test servers) gets `/realtime` appended.
//!
//! The WebSocket URL carries the connect-time authorization headers and an
//! empty payload object as base64-encoded query parameters:
//!
//! ```text
//! wss://<host>/<path>?header=<base64(headers JSON)>&payload=<base64("{}")>
//! ```

use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use url::Url;

use crate::auth::Headers;
use crate::error::RealtimeError;

/// Matcher for standard AppSync API domains.
#[allow(clippy::expect_used)]
fn standard_domain() -> &'static Regex {
    static STANDARD_DOMAIN: OnceLock<Regex> = OnceLock::new();
    STANDARD_DOMAIN.get_or_init(|| {
        Regex::new(r"(?i)^https://\w{26}\.appsync-api\.\w{2}(?:-\w{2,})+-\d\.amazonaws\.com/graphql$")
            .expect("static domain pattern is valid")
    })
}

/// A GraphQL API endpoint and its derived realtime address.
#[derive(Debug, Clone)]
pub struct Endpoint {
    api_url: String,
}

impl Endpoint {
    /// Create an endpoint from the base `https://` API URL.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }

    /// The base API URL this endpoint was created with.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The `https://` form of the realtime endpoint.
    #[must_use]
    pub fn realtime_base(&self) -> String {
        if standard_domain().is_match(&self.api_url) {
            self.api_url.replace("appsync-api", "appsync-realtime-api")
        } else {
            format!("{}/realtime", self.api_url)
        }
    }

    /// Build the `wss://` connection URL for one connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidEndpoint`] if the configured API URL
    /// cannot be parsed, and [`RealtimeError::Protocol`] if the headers fail
    /// to serialize.
    pub(crate) fn connection_url(&self, headers: &Headers) -> Result<String, RealtimeError> {
        let base = self.realtime_base();
        let url =
            Url::parse(&base).map_err(|e| RealtimeError::InvalidEndpoint(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| RealtimeError::InvalidEndpoint(format!("no host in {base}")))?;

        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let header_json = serde_json::to_string(headers)
            .map_err(|e| RealtimeError::Protocol(e.to_string()))?;

        Ok(format!(
            "wss://{authority}{path}?header={header}&payload={payload}",
            path = url.path(),
            header = BASE64.encode(header_json),
            payload = BASE64.encode("{}"),
        ))
    }
}
