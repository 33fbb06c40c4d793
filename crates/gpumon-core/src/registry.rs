//! Gauge registry and refresh callbacks.
//!
//! The registry owns one [`Instrument`] per exported metric name and one
//! refresh callback per registered collector. Registration needs `&mut
//! self` and refreshing needs `&self`, so once the registry is shared with
//! the periodic reader its instrument set can no longer change.
//!
//! A refresh cycle polls every callback in turn (never two at once), turns
//! each reading into labeled observations, and records failures without
//! letting one collector's error affect the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::collector::{CollectError, GpuCollector};
use crate::reading::{GpuReading, MetricValue};

/// Attribute key identifying the device.
pub const ATTR_GPU_ID: &str = "gpu_id";
/// Attribute key carrying the device's display name.
pub const ATTR_GPU_NAME: &str = "gpu_name";
/// Attribute key identifying the collector, on per-collector instruments.
pub const ATTR_COLLECTOR: &str = "collector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    IntGauge,
    DoubleGauge,
    /// Monotonic cumulative sum.
    Counter,
}

/// Descriptor of an observable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instrument {
    pub name: &'static str,
    pub kind: InstrumentKind,
    /// UCUM unit string.
    pub unit: &'static str,
    pub description: &'static str,
}

pub const MEMORY_USED_BYTES: Instrument = Instrument {
    name: "gpu.memory_used_bytes",
    kind: InstrumentKind::IntGauge,
    unit: "By",
    description: "GPU memory in use",
};

pub const UTILIZATION_PERCENT: Instrument = Instrument {
    name: "gpu.utilization_percent",
    kind: InstrumentKind::DoubleGauge,
    unit: "%",
    description: "GPU compute utilization",
};

pub const CONVERSION_ERRORS: Instrument = Instrument {
    name: "gpumon.conversion_errors",
    kind: InstrumentKind::Counter,
    unit: "1",
    description: "Fields defaulted to zero after failing to parse, cumulative per collector",
};

/// Instruments every registry carries regardless of source.
pub const CANONICAL_INSTRUMENTS: [Instrument; 3] =
    [MEMORY_USED_BYTES, UTILIZATION_PERCENT, CONVERSION_ERRORS];

/// One recorded value with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub instrument: &'static str,
    pub value: MetricValue,
    pub attributes: Vec<(&'static str, String)>,
}

/// A callback that failed during a refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub collector: &'static str,
    pub error: String,
    /// The collector cannot recover within this run.
    pub fatal: bool,
}

/// Result of one refresh cycle.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub observations: Vec<Observation>,
    pub failures: Vec<RefreshFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// A collector with this name already has a callback.
    DuplicateCollector(&'static str),
    /// Two collectors define the same instrument name differently.
    InstrumentConflict(&'static str),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateCollector(name) => {
                write!(f, "collector '{}' is already registered", name)
            }
            RegistryError::InstrumentConflict(name) => {
                write!(f, "instrument '{}' is registered with a different definition", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Refresh callback bound to one collector.
struct RefreshCallback {
    collector: Arc<dyn GpuCollector>,
    conversion_errors: AtomicU64,
}

impl RefreshCallback {
    /// Collects once and appends observations. Errors propagate to the caller.
    async fn invoke(
        &self,
        instruments: &BTreeMap<&'static str, Instrument>,
        timeout: Duration,
        cancel: &CancellationToken,
        out: &mut Vec<Observation>,
    ) -> Result<usize, CollectError> {
        let readings = tokio::time::timeout(timeout, self.collector.collect(cancel))
            .await
            .map_err(|_| CollectError::Timeout(timeout))??;

        let mut errors = 0u64;
        for reading in &readings {
            observe_reading(reading, instruments, out);
            errors += u64::from(reading.conversion_errors());
        }

        let total = self.conversion_errors.fetch_add(errors, Ordering::Relaxed) + errors;
        out.push(Observation {
            instrument: CONVERSION_ERRORS.name,
            value: MetricValue::Int(i64::try_from(total).unwrap_or(i64::MAX)),
            attributes: vec![(ATTR_COLLECTOR, self.collector.name().to_string())],
        });

        Ok(readings.len())
    }
}

fn observe_reading(
    reading: &GpuReading,
    instruments: &BTreeMap<&'static str, Instrument>,
    out: &mut Vec<Observation>,
) {
    let mut attributes = vec![(ATTR_GPU_ID, reading.device_id().to_string())];
    if !reading.device_name().is_empty() {
        attributes.push((ATTR_GPU_NAME, reading.device_name().to_string()));
    }

    out.push(Observation {
        instrument: MEMORY_USED_BYTES.name,
        value: MetricValue::Int(i64::try_from(reading.memory_used_bytes()).unwrap_or(i64::MAX)),
        attributes: attributes.clone(),
    });
    out.push(Observation {
        instrument: UTILIZATION_PERCENT.name,
        value: MetricValue::Double(reading.utilization_percent()),
        attributes: attributes.clone(),
    });

    for sample in reading.details() {
        let Some(instrument) = instruments.get(sample.instrument) else {
            debug!(instrument = sample.instrument, "skipping sample for unregistered instrument");
            continue;
        };
        let value = match (instrument.kind, sample.value) {
            (InstrumentKind::IntGauge | InstrumentKind::Counter, MetricValue::Double(v)) => {
                MetricValue::Int(v as i64)
            }
            (InstrumentKind::DoubleGauge, MetricValue::Int(v)) => MetricValue::Double(v as f64),
            (_, v) => v,
        };
        out.push(Observation {
            instrument: instrument.name,
            value,
            attributes: attributes.clone(),
        });
    }
}

/// Instruments plus one refresh callback per collector.
pub struct GaugeRegistry {
    instruments: BTreeMap<&'static str, Instrument>,
    /// Registration order, used for stable export ordering.
    order: Vec<&'static str>,
    callbacks: Vec<RefreshCallback>,
    collect_timeout: Duration,
}

impl GaugeRegistry {
    /// Creates a registry holding the canonical instruments.
    ///
    /// `collect_timeout` bounds each callback's `collect` within a cycle.
    pub fn new(collect_timeout: Duration) -> Self {
        let mut registry = Self {
            instruments: BTreeMap::new(),
            order: Vec::new(),
            callbacks: Vec::new(),
            collect_timeout,
        };
        for instrument in CANONICAL_INSTRUMENTS {
            registry.instruments.insert(instrument.name, instrument);
            registry.order.push(instrument.name);
        }
        registry
    }

    /// Registers the collector's instruments and its refresh callback.
    pub fn register(&mut self, collector: Arc<dyn GpuCollector>) -> Result<(), RegistryError> {
        let name = collector.name();
        if self.callbacks.iter().any(|cb| cb.collector.name() == name) {
            return Err(RegistryError::DuplicateCollector(name));
        }

        for instrument in collector.instruments() {
            if let Some(existing) = self.instruments.get(instrument.name)
                && existing != instrument
            {
                return Err(RegistryError::InstrumentConflict(instrument.name));
            }
        }
        for instrument in collector.instruments() {
            if self.instruments.insert(instrument.name, *instrument).is_none() {
                self.order.push(instrument.name);
            }
        }

        debug!(
            collector = name,
            instruments = self.instruments.len(),
            "refresh callback registered"
        );
        self.callbacks.push(RefreshCallback {
            collector,
            conversion_errors: AtomicU64::new(0),
        });
        Ok(())
    }

    pub fn instrument(&self, name: &str) -> Option<&Instrument> {
        self.instruments.get(name)
    }

    /// Instruments in registration order.
    pub fn instruments(&self) -> Vec<Instrument> {
        self.order
            .iter()
            .filter_map(|name| self.instruments.get(name).copied())
            .collect()
    }

    pub fn collector_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Runs every callback once, sequentially.
    ///
    /// A failing callback is logged and recorded in
    /// [`RefreshOutcome::failures`]; the remaining callbacks still run.
    pub async fn refresh(&self, cancel: &CancellationToken) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        for cb in &self.callbacks {
            let name = cb.collector.name();
            let start = Instant::now();
            match cb
                .invoke(&self.instruments, self.collect_timeout, cancel, &mut outcome.observations)
                .await
            {
                Ok(devices) => {
                    debug!(
                        collector = name,
                        devices,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "collector refreshed"
                    );
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    if fatal {
                        error!(collector = name, error = %e, "collector is unusable, its gauges stay empty");
                    } else {
                        warn!(
                            collector = name,
                            error = %e,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "refresh failed, retrying next cycle"
                        );
                    }
                    outcome.failures.push(RefreshFailure {
                        collector: name,
                        error: e.to_string(),
                        fatal,
                    });
                }
            }
        }

        outcome
    }
}
