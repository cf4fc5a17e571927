//! Prometheus metrics for observability and monitoring.
//!
//! Metric families:
//! - Store: reducer execution and effect handling (`store.*`)
//! - Ledger reads: collection reads and per-index point reads
//! - Transactions: submissions and their terminal outcomes
//!
//! # Example
//!
//! ```rust,no_run
//! use parkmarket_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Registers metric descriptions and installs the Prometheus recorder
    /// with an HTTP listener on the configured address.
    ///
    /// Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built. A recorder that is
    /// already installed is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                    120.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(exporter);
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started");
            },
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            },
        }
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("store.commands.total", "Actions sent to stores");
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside reducers"
    );
    describe_counter!(
        "store.effects.executed",
        "Effects started, labelled by effect type"
    );

    describe_counter!(
        "ledger_collection_reads_total",
        "Collection reads (count plus point reads), labelled by collection"
    );
    describe_counter!(
        "ledger_point_reads_failed_total",
        "Point reads that failed and left an unavailable slot"
    );
    describe_histogram!(
        "ledger_collection_read_duration_seconds",
        "Time to materialize a collection snapshot"
    );
    describe_gauge!(
        "ledger_collection_size",
        "Last observed count, labelled by collection"
    );

    describe_counter!(
        "transactions_submitted_total",
        "Mutating calls submitted, labelled by ledger function"
    );
    describe_counter!(
        "transactions_completed_total",
        "Terminal transaction outcomes, labelled by function and outcome"
    );
    describe_counter!(
        "transactions_rejected_total",
        "Submissions rejected locally because the action was busy"
    );
    describe_counter!(
        "authentication_failures_total",
        "Reveals rejected because the secret did not match"
    );
    describe_histogram!(
        "transaction_duration_seconds",
        "Time from submission to a terminal outcome"
    );
}

/// Ledger read metrics recorder.
pub struct LedgerReadMetrics;

impl LedgerReadMetrics {
    /// Record a completed collection read.
    pub fn record_collection(collection: &'static str, size: u64, failed: usize, duration: Duration) {
        counter!("ledger_collection_reads_total", "collection" => collection).increment(1);
        counter!("ledger_point_reads_failed_total", "collection" => collection)
            .increment(failed as u64);
        histogram!("ledger_collection_read_duration_seconds", "collection" => collection)
            .record(duration.as_secs_f64());
        #[allow(clippy::cast_precision_loss)]
        gauge!("ledger_collection_size", "collection" => collection).set(size as f64);
    }
}

/// Transaction metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record a submission.
    pub fn record_submitted(function: &'static str) {
        counter!("transactions_submitted_total", "function" => function).increment(1);
    }

    /// Record a terminal outcome.
    pub fn record_completed(function: &'static str, outcome: &'static str, duration: Duration) {
        counter!(
            "transactions_completed_total",
            "function" => function,
            "outcome" => outcome
        )
        .increment(1);
        histogram!("transaction_duration_seconds", "function" => function)
            .record(duration.as_secs_f64());
    }

    /// Record a submission refused because another attempt was in flight.
    pub fn record_rejected() {
        counter!("transactions_rejected_total").increment(1);
    }

    /// Record a failed reveal.
    pub fn record_authentication_failure() {
        counter!("authentication_failures_total").increment(1);
    }
}
