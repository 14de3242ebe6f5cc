//! Metrics exposition.
//!
//! # Metrics
//! - `mux_connections_total` (counter): classified connections by node, branch
//! - `mux_rejected_total` (counter): dropped connections by node, reason
//! - `rpc_requests_total` (counter): calls by method, code
//! - `rpc_request_duration_seconds` (histogram): call latency by method
//! - `auth_verifications_total` (counter): token checks by outcome
//! - `auth_decisions_total` (counter): authorization results by allowed
//! - `active_connections` (gauge): open connections by server
//! - `health_failed_rounds` (gauge): consecutive failed health rounds
//!
//! Recording goes through the `metrics` facade everywhere; this module only
//! installs the Prometheus recorder and runs its scrape endpoint.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// Latency buckets in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to build Prometheus exporter: {0}")]
    Build(#[from] BuildError),

    #[error("a global metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Running scrape endpoint.
#[derive(Debug)]
pub struct MetricsExporter {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MetricsExporter {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving `/metrics`. The recorder stays installed.
    pub fn stop(self) {
        self.task.abort();
        tracing::info!(address = %self.addr, "Metrics exporter stopped");
    }
}

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn start_exporter(addr: SocketAddr) -> Result<MetricsExporter, MetricsError> {
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)?
        .build()?;

    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;

    let task = tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "Metrics exporter failed");
        }
    });

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(MetricsExporter { addr, task })
}
