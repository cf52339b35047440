//! Prometheus metrics for the reservation core.
//!
//! Covers the three runtime components:
//! - ledger executions, replays, coalesced waits, conflicts, pruning
//! - render cache hits/misses, evictions, render errors and latency
//! - booking operations by action and outcome
//!
//! # Example
//!
//! ```rust,no_run
//! use velvet_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape via server.render()
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder with a scrape-ready render handle.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to advertise (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// existing recorder keeps collecting and this call succeeds without a
    /// local render handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - scrape endpoint at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder hasn't been installed here.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Ledger
    describe_counter!(
        "ledger_executions_total",
        "Total executions requested through the idempotency ledger"
    );
    describe_counter!(
        "ledger_replays_total",
        "Executions answered from a stored outcome without re-running"
    );
    describe_counter!(
        "ledger_coalesced_waits_total",
        "Duplicate callers that waited on an in-flight operation"
    );
    describe_counter!(
        "ledger_conflicts_total",
        "Idempotency keys reused with a different request fingerprint"
    );
    describe_counter!(
        "ledger_entries_pruned_total",
        "Completed ledger entries reclaimed by retention or capacity"
    );

    // Render cache
    describe_counter!(
        "render_cache_hits_total",
        "Lookups answered by conditional match or a fresh cached payload"
    );
    describe_counter!(
        "render_cache_misses_total",
        "Lookups that required a renderer invocation"
    );
    describe_counter!(
        "render_cache_evictions_total",
        "Payloads evicted under capacity pressure"
    );
    describe_counter!(
        "render_cache_render_errors_total",
        "Renderer invocations that failed"
    );
    describe_counter!(
        "render_cache_coalesced_waits_total",
        "Concurrent misses that shared an in-flight render"
    );
    describe_histogram!(
        "render_cache_render_duration_seconds",
        "Time taken by renderer invocations"
    );

    // Booking operations
    describe_counter!(
        "booking_operations_total",
        "Booking lifecycle operations by action and outcome"
    );
}
