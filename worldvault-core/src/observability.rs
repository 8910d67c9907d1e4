/*!
Observability infrastructure for worldvault.

This module provides:
- Structured logging setup (compact text or JSON)
- Prometheus metrics for backup cycles, behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::path::Path;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

use crate::{BackupError, Result};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise the level is `info`, or `debug`
/// when `verbose` is set.
pub fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    result.map_err(|e| BackupError::configuration(format!("Failed to set global tracing subscriber: {e}")))
}

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackupMetrics>> = OnceLock::new();

/// Metrics collection for backup cycles
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub cycles_total: IntCounter,
    pub cycle_failures_total: IntCounterVec,
    pub uploaded_bytes_total: IntCounter,
    pub deleted_backups_total: IntCounter,
    pub stored_backups: IntGauge,
    pub stored_bytes: IntGauge,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    /// Initialize a new metrics instance with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let metric_err = |e: prometheus::Error| BackupError::Metrics(e.to_string());

        let cycles_total = IntCounter::new(
            "worldvault_cycles_total",
            "Backup cycles that completed successfully",
        )
        .map_err(metric_err)?;
        let cycle_failures_total = IntCounterVec::new(
            Opts::new(
                "worldvault_cycle_failures_total",
                "Backup cycles that failed, by stage",
            ),
            &["stage"],
        )
        .map_err(metric_err)?;
        let uploaded_bytes_total = IntCounter::new(
            "worldvault_uploaded_bytes_total",
            "Archive bytes uploaded to the object store",
        )
        .map_err(metric_err)?;
        let deleted_backups_total = IntCounter::new(
            "worldvault_deleted_backups_total",
            "Backups removed by retention",
        )
        .map_err(metric_err)?;
        let stored_backups = IntGauge::new(
            "worldvault_stored_backups",
            "Backups in the store after the last cycle",
        )
        .map_err(metric_err)?;
        let stored_bytes = IntGauge::new(
            "worldvault_stored_bytes",
            "Combined size of the stored backups after the last cycle",
        )
        .map_err(metric_err)?;

        registry
            .register(Box::new(cycles_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(cycle_failures_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(uploaded_bytes_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(deleted_backups_total.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(stored_backups.clone()))
            .map_err(metric_err)?;
        registry
            .register(Box::new(stored_bytes.clone()))
            .map_err(metric_err)?;

        Ok(Self {
            cycles_total,
            cycle_failures_total,
            uploaded_bytes_total,
            deleted_backups_total,
            stored_backups,
            stored_bytes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// Returns `None` if the registry could not be built; metrics are then
    /// skipped rather than taking the process down.
    pub fn global() -> Option<&'static BackupMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Record a completed cycle
    pub fn record_success(&self, uploaded_bytes: u64, deleted: usize, count: u32, total_bytes: u64) {
        self.cycles_total.inc();
        self.uploaded_bytes_total.inc_by(uploaded_bytes);
        self.deleted_backups_total.inc_by(deleted as u64);
        self.stored_backups.set(i64::from(count));
        self.stored_bytes
            .set(i64::try_from(total_bytes).unwrap_or(i64::MAX));
    }

    /// Record a failed cycle
    pub fn record_failure(&self, stage: &str) {
        self.cycle_failures_total.with_label_values(&[stage]).inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::Metrics(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackupError::Metrics(format!("Failed to convert metrics to string: {e}")))
    }

    /// Write the metrics to a textfile-collector file, atomically
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.gather_metrics()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
