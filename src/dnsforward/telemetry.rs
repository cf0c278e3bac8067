//! Prometheus metrics installation. The counters and histogram themselves
//! are emitted inline at the call sites in `transport` and `forwarder` via
//! the `metrics` facade macros; this module only owns the one-time recorder
//! install and the handle used to render the exposition text.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate. Call once per
/// process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = std::sync::Arc<PrometheusHandle>;
