//! Transaction coordinator metrics
//!
//! Metrics go through the `metrics` facade when the `metrics-prometheus`
//! feature is enabled and compile to no-ops otherwise. [`TxStats`] keeps
//! in-process counters that are always available.
//!
//! ```rust,ignore
//! use rivven_txn::observability::{init_metrics, TxMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! TxMetrics::increment_committed();
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Transaction coordinator metrics
pub struct TxMetrics;

impl TxMetrics {
    // ---- Counters ----

    pub fn increment_started() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_started_total").increment(1);
    }

    pub fn increment_committed() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_committed_total").increment(1);
    }

    pub fn increment_aborted() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_aborted_total").increment(1);
    }

    /// Requests rejected because of a stale producer identity
    pub fn increment_fenced() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_fenced_total").increment(1);
    }

    /// Prepare rejected by at least one participant
    pub fn increment_rejected() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_rejected_total").increment(1);
    }

    pub fn increment_expired() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_expired_total").increment(1);
    }

    /// Unfinished decided transactions completed by a later access
    pub fn increment_rollforward() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("rivven_txn_rollforward_total").increment(1);
    }

    // ---- Gauges ----

    pub fn set_background_tasks(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("rivven_txn_background_tasks").set(count as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    // ---- Histograms ----

    /// Time from end_transaction request to client-visible decision
    pub fn record_end_latency(latency: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("rivven_txn_end_latency_seconds").record(latency.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = latency;
    }
}

/// In-process transaction counters
#[derive(Debug, Default)]
pub struct TxStats {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    fenced: AtomicU64,
    expired: AtomicU64,
    rolled_forward: AtomicU64,
}

impl TxStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_started();
    }

    pub fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_committed();
    }

    pub fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_aborted();
    }

    pub fn record_fenced(&self) {
        self.fenced.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_fenced();
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_expired();
    }

    pub fn record_rollforward(&self) {
        self.rolled_forward.fetch_add(1, Ordering::Relaxed);
        TxMetrics::increment_rollforward();
    }

    pub fn snapshot(&self) -> TxStatsSnapshot {
        TxStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            fenced: self.fenced.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            rolled_forward: self.rolled_forward.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TxStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxStatsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub fenced: u64,
    pub expired: u64,
    pub rolled_forward: u64,
}

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Install the Prometheus recorder and serve `/metrics` on `addr`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem; later calls are no-ops
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Transaction metrics initialized"
        );
    });
    Ok(())
}
