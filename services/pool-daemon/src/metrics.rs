//! Prometheus metrics exposition
//!
//! The pool library emits through the `metrics` facade:
//!
//! - `kiro_pool_refresh_total` (counter): label `result`
//! - `kiro_pool_cooldowns_total` (counter): label `reason`
//! - `kiro_pool_suspensions_total` (counter)
//! - `kiro_pool_failures_total` (counter)
//! - `kiro_pool_quota_checks_total` (counter): label `result`
//!
//! The daemon adds pool-level gauges refreshed on every health check.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering
/// metrics on `/metrics`. Fails if a recorder is already installed.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Publish the account counts from a pool health snapshot.
pub fn record_pool_health(total: usize, available: usize, cooling_down: usize, suspended: usize) {
    metrics::gauge!("kiro_pool_accounts", "status" => "total").set(total as f64);
    metrics::gauge!("kiro_pool_accounts", "status" => "available").set(available as f64);
    metrics::gauge!("kiro_pool_accounts", "status" => "cooling_down").set(cooling_down as f64);
    metrics::gauge!("kiro_pool_accounts", "status" => "suspended").set(suspended as f64);
}
