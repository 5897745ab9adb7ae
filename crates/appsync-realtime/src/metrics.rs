//! Client Metrics
//!
//! Metric names emitted through the `metrics` facade. The library records
//! into whatever recorder the embedding application installs; it never
//! installs one itself.

use metrics::{describe_counter, describe_gauge};

/// Connection attempts, successful or not.
pub const CONNECT_ATTEMPTS: &str = "appsync_client_connect_attempts_total";

/// Connection attempts that failed and were retried or gave up.
pub const CONNECT_FAILURES: &str = "appsync_client_connect_failures_total";

/// Subscription start attempts.
pub const START_ATTEMPTS: &str = "appsync_client_start_attempts_total";

/// Data frames delivered to subscription callers.
pub const DATA_FRAMES: &str = "appsync_client_data_frames_total";

/// Keep-alive expiries that closed the shared connection.
pub const KEEPALIVE_EXPIRIES: &str = "appsync_client_keepalive_expiries_total";

/// Currently registered subscriptions on the shared connection.
pub const ACTIVE_SUBSCRIPTIONS: &str = "appsync_client_active_subscriptions";

/// Register metric descriptions with the installed recorder.
///
/// Optional; call once at startup if the embedding application wants
/// described metrics.
pub fn describe_metrics() {
    describe_counter!(
        CONNECT_ATTEMPTS,
        "Total realtime connection attempts (including retries)"
    );
    describe_counter!(
        CONNECT_FAILURES,
        "Total failed realtime connection attempts"
    );
    describe_counter!(START_ATTEMPTS, "Total subscription start attempts");
    describe_counter!(DATA_FRAMES, "Total data frames delivered to callers");
    describe_counter!(
        KEEPALIVE_EXPIRIES,
        "Total connections closed by keep-alive expiry"
    );
    describe_gauge!(
        ACTIVE_SUBSCRIPTIONS,
        "Subscriptions currently registered on the shared connection"
    );
}
