//! Prometheus metrics exposition
//!
//! - `console_api_requests_total` (counter): labels `status`, `method`
//! - `console_api_request_duration_seconds` (histogram): label `status`
//! - `console_token_refresh_total` (counter): label `outcome`
//! - `console_auth_callbacks_total` (counter): label `outcome`
//!
//! The API request metrics are recorded by the dispatcher and the session
//! refresh counter by the token manager; this module installs the recorder
//! and records what only the HTTP handlers see.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 60s, covering the configurable API timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("console_api_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration metric renders as a histogram (`_bucket` lines for
/// `histogram_quantile()`) rather than the default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record the outcome of an OAuth callback: `success`, `denied`,
/// `missing_code`, `state_mismatch`, `exchange_failed`.
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("console_auth_callbacks_total", "outcome" => outcome).increment(1);
}

/// Record a refresh performed by the token endpoint handler.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("console_token_refresh_total", "outcome" => outcome).increment(1);
}
