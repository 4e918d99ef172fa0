//! Dispatcher metrics
//!
//! Recorded through the `metrics` facade; calls are no-ops until the host
//! installs a recorder.
//!
//! - `session_requests_total` (counter): label `outcome`
//! - `session_refresh_total` (counter): label `outcome`
//! - `session_retries_total` (counter)

/// Record the terminal outcome of one `Dispatcher::send`.
pub fn record_request(outcome: &'static str) {
    metrics::counter!("session_requests_total", "outcome" => outcome).increment(1);
}

/// Record the outcome of one call to the refresh endpoint.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}

/// Record a request resubmitted after a refresh.
pub fn record_retry() {
    metrics::counter!("session_retries_total").increment(1);
}
