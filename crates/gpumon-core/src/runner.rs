//! Collection runner: owns one collection run from start to shutdown.
//!
//! Validates the configuration, starts the chosen collector, registers it,
//! and keeps the meter pipeline exporting until cancellation. Whatever the
//! collector owns (the stream source's monitor process) is released on
//! every exit path: explicitly through [`GpuCollector::shutdown`], and as a
//! backstop through `kill_on_drop` when the collector is dropped.

use std::sync::Arc;

use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collector::{CollectError, GpuCollector};
use crate::config::{Config, ConfigError};
use crate::export::{ExportError, MeterPipeline};
use crate::reader::{RunStats, SharedRefresh};
use crate::registry::{GaugeRegistry, RegistryError};

/// Which data source a run collects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// `nvidia-smi -q -x` per poll.
    Snapshot,
    /// Long-lived `dynolog` process.
    Stream,
}

/// Errors that prevent a run from starting.
#[derive(Debug)]
pub enum RunError {
    Config(ConfigError),
    Start(CollectError),
    Exporter(ExportError),
    Registry(RegistryError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "invalid configuration: {}", e),
            RunError::Start(e) => write!(f, "collector failed to start: {}", e),
            RunError::Exporter(e) => write!(f, "exporter failed to start: {}", e),
            RunError::Registry(e) => write!(f, "callback registration failed: {}", e),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Config(e) => Some(e),
            RunError::Start(e) => Some(e),
            RunError::Exporter(e) => Some(e),
            RunError::Registry(e) => Some(e),
        }
    }
}

impl From<RegistryError> for RunError {
    fn from(e: RegistryError) -> Self {
        RunError::Registry(e)
    }
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        RunError::Config(e)
    }
}

/// Runs collection from `source` against the configured OTLP backend
/// until `cancel` fires.
#[cfg(feature = "otlp")]
pub async fn run(
    config: &Config,
    source: Source,
    cancel: CancellationToken,
) -> Result<RunStats, RunError> {
    use crate::collector::{SnapshotCollector, StreamTailCollector};
    use crate::export::{metrics_url, otlp_exporter};
    use tracing::warn;

    config.validate()?;

    if config.export.api_key.is_none() {
        warn!("no API key configured, the backend may reject exports");
    }
    let exporter = otlp_exporter(&config.export).map_err(RunError::Exporter)?;
    info!(url = %metrics_url(&config.export.endpoint), "OTLP exporter ready");

    let collector: Arc<dyn GpuCollector> = match source {
        Source::Snapshot => Arc::new(SnapshotCollector::new(&config.snapshot)),
        Source::Stream => Arc::new(StreamTailCollector::start(&config.stream).map_err(RunError::Start)?),
    };

    run_with(config, collector, exporter, cancel).await
}

/// Runs an already constructed collector against `exporter` until `cancel`
/// fires, then flushes and releases the collector.
///
/// Must run on a multi-threaded runtime: instrument callbacks block on the
/// runtime from the exporter's thread.
pub async fn run_with<E: PushMetricExporter>(
    config: &Config,
    collector: Arc<dyn GpuCollector>,
    exporter: E,
    cancel: CancellationToken,
) -> Result<RunStats, RunError> {
    if let Err(e) = config.validate() {
        collector.shutdown().await;
        return Err(e.into());
    }

    let mut registry = GaugeRegistry::new(config.export.collect_timeout());
    if let Err(e) = registry.register(collector.clone()) {
        collector.shutdown().await;
        return Err(e.into());
    }

    let refresh = Arc::new(SharedRefresh::new(
        Arc::new(registry),
        Handle::current(),
        config.export.interval,
    ));
    let pipeline = MeterPipeline::start(
        exporter,
        refresh.clone(),
        config.export.interval,
        &config.service_name,
    );

    info!(
        collector = collector.name(),
        interval_s = config.export.interval.as_secs_f64(),
        service = %config.service_name,
        "{} metrics collection running; Ctrl+C to exit",
        collector.name()
    );

    cancel.cancelled().await;

    info!("flushing final refresh cycle");
    if let Err(e) = pipeline.shutdown().await {
        error!(error = %e, "final export failed");
    }

    collector.shutdown().await;
    Ok(refresh.stats())
}
