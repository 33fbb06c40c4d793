//! Run configuration.
//!
//! All collection settings are passed into constructors through [`Config`];
//! nothing in the library reads flags or environment variables itself.
//! Defaults mirror the reference deployment.

use std::time::Duration;

/// Default export interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Default device memory used to turn the stream source's memory
/// utilization percent into bytes (80 GiB, an H100/A100-80G card).
pub const DEFAULT_MEMORY_CAPACITY_BYTES: u64 = 80 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// `service.name` resource attribute on every export.
    pub service_name: String,
    pub export: ExportConfig,
    pub snapshot: SnapshotSourceConfig,
    pub stream: StreamSourceConfig,
}

impl Config {
    /// Rejects settings the run cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.export.collect_timeout().is_zero() {
            return Err(ConfigError::ZeroCollectTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroInterval,
    ZeroCollectTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroInterval => write!(f, "export interval must be greater than zero"),
            ConfigError::ZeroCollectTimeout => {
                write!(f, "collect timeout must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "gpu-mon".to_string(),
            export: ExportConfig::default(),
            snapshot: SnapshotSourceConfig::default(),
            stream: StreamSourceConfig::default(),
        }
    }
}

/// Remote backend and refresh cadence.
#[derive(Clone)]
pub struct ExportConfig {
    /// Base URL of the OTLP/HTTP receiver; `/v1/metrics` is appended.
    pub endpoint: String,
    /// Header carrying the API key.
    pub auth_header: String,
    pub api_key: Option<String>,
    /// Period between refresh cycles.
    pub interval: Duration,
    /// Upper bound for one collector's `collect` within a cycle.
    /// `None` means the export interval.
    pub collect_timeout: Option<Duration>,
    /// Upper bound for one HTTP push.
    pub request_timeout: Duration,
}

impl ExportConfig {
    /// Effective per-collect deadline.
    pub fn collect_timeout(&self) -> Duration {
        self.collect_timeout.unwrap_or(self.interval)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.honeycomb.io".to_string(),
            auth_header: "x-honeycomb-team".to_string(),
            api_key: None,
            interval: DEFAULT_INTERVAL,
            collect_timeout: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

// Hand-written so the API key never lands in logs.
impl std::fmt::Debug for ExportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_header", &self.auth_header)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("interval", &self.interval)
            .field("collect_timeout", &self.collect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Snapshot source: one query command per poll.
#[derive(Debug, Clone)]
pub struct SnapshotSourceConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SnapshotSourceConfig {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            args: vec!["-q".to_string(), "-x".to_string()],
        }
    }
}

/// Stream source: one long-lived monitor process per run.
#[derive(Debug, Clone)]
pub struct StreamSourceConfig {
    pub program: String,
    pub dcgm_lib_path: String,
    pub reporting_interval_s: u64,
    /// Appended after the built-in flags.
    pub extra_args: Vec<String>,
    /// Device memory used to scale the memory utilization percent to bytes.
    pub memory_capacity_bytes: u64,
}

impl StreamSourceConfig {
    /// Full argument list for the monitor process.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--enable_gpu_monitor".to_string(),
            format!("--dcgm_lib_path={}", self.dcgm_lib_path),
            "--use_JSON".to_string(),
            "--dcgm_reporting_interval_s".to_string(),
            self.reporting_interval_s.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Default for StreamSourceConfig {
    fn default() -> Self {
        Self {
            program: "dynolog".to_string(),
            dcgm_lib_path: "/lib/x86_64-linux-gnu/libdcgm.so.4".to_string(),
            reporting_interval_s: 1,
            extra_args: Vec::new(),
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY_BYTES,
        }
    }
}
