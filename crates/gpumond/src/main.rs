//! gpumond - GPU telemetry collector daemon.
//!
//! Polls GPU utilization from `nvidia-smi` or tails `dynolog`'s DCGM
//! output, and pushes the readings to an OTLP/HTTP backend on a fixed
//! interval until interrupted.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use gpumon_core::config::{Config, ExportConfig, SnapshotSourceConfig, StreamSourceConfig};
use gpumon_core::runner::{self, Source};

/// GPU telemetry collector daemon.
#[derive(Parser)]
#[command(name = "gpumond", about = "GPU telemetry collector daemon", version = gpumon_core::VERSION)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Export interval in seconds.
    #[arg(short, long, default_value = "15", env = "GPUMON_INTERVAL", global = true)]
    interval: u64,

    /// Per-cycle collection deadline in seconds. Defaults to the interval.
    #[arg(long, env = "GPUMON_COLLECT_TIMEOUT", global = true)]
    collect_timeout: Option<u64>,

    /// OTLP/HTTP endpoint; `/v1/metrics` is appended.
    #[arg(long, default_value = "https://api.honeycomb.io", env = "GPUMON_ENDPOINT", global = true)]
    endpoint: String,

    /// API key sent in the auth header.
    #[arg(long, env = "HONEYCOMB_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Header carrying the API key.
    #[arg(long, default_value = "x-honeycomb-team", global = true)]
    auth_header: String,

    /// `service.name` resource attribute.
    #[arg(long, default_value = "gpu-mon", env = "GPUMON_SERVICE_NAME", global = true)]
    service_name: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Collect GPU metrics via nvidia-smi
    #[command(name = "nvidia-smi-poll")]
    NvidiaSmiPoll {
        /// nvidia-smi binary.
        #[arg(long, default_value = "nvidia-smi")]
        nvidia_smi: String,
    },
    /// Collect GPU metrics via dynolog JSON (on stderr)
    #[command(name = "dynolog-poll")]
    DynologPoll {
        /// dynolog binary.
        #[arg(long, default_value = "dynolog")]
        dynolog: String,

        /// Path to libdcgm passed to dynolog.
        #[arg(long, default_value = "/lib/x86_64-linux-gnu/libdcgm.so.4")]
        dcgm_lib_path: String,

        /// DCGM reporting interval in seconds.
        #[arg(long, default_value = "1")]
        reporting_interval: u64,

        /// Device memory used to convert memory utilization to bytes (e.g. "80G", "40960M").
        #[arg(long, default_value = "80G", value_parser = parse_size)]
        memory_capacity: u64,

        /// Extra arguments appended to the dynolog command line.
        #[arg(last = true)]
        extra: Vec<String>,
    },
}

/// Parses a human-readable size string (e.g., "80G", "500M", "1024K") into bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    // SDK internals (export failures) at warn at most.
    let sdk_level = if quiet { Level::ERROR } else { Level::WARN };

    let mut filter = EnvFilter::from_default_env();
    let directives = ["gpumond", "gpumon_core", "gpumon"]
        .iter()
        .map(|target| format!("{}={}", target, level))
        .chain(["opentelemetry", "opentelemetry_sdk", "opentelemetry_otlp"]
            .iter()
            .map(|target| format!("{}={}", target, sdk_level)));
    for directive in directives {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Maps command-line arguments onto the run configuration.
fn build_config(args: &Args) -> (Config, Source) {
    let export = ExportConfig {
        endpoint: args.endpoint.clone(),
        auth_header: args.auth_header.clone(),
        api_key: args.api_key.clone().filter(|k| !k.is_empty()),
        interval: Duration::from_secs(args.interval),
        collect_timeout: args.collect_timeout.map(Duration::from_secs),
        ..ExportConfig::default()
    };

    let mut config = Config {
        service_name: args.service_name.clone(),
        export,
        ..Config::default()
    };

    let source = match &args.command {
        Command::NvidiaSmiPoll { nvidia_smi } => {
            config.snapshot = SnapshotSourceConfig {
                program: nvidia_smi.clone(),
                ..SnapshotSourceConfig::default()
            };
            Source::Snapshot
        }
        Command::DynologPoll {
            dynolog,
            dcgm_lib_path,
            reporting_interval,
            memory_capacity,
            extra,
        } => {
            config.stream = StreamSourceConfig {
                program: dynolog.clone(),
                dcgm_lib_path: dcgm_lib_path.clone(),
                reporting_interval_s: *reporting_interval,
                extra_args: extra.clone(),
                memory_capacity_bytes: *memory_capacity,
            };
            Source::Stream
        }
    };

    (config, source)
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let (config, source) = build_config(&args);

    info!("gpumond {} starting", gpumon_core::VERSION);
    info!(
        "Config: source={:?}, interval={}s, endpoint={}, service={}",
        source,
        config.export.interval.as_secs(),
        config.export.endpoint,
        config.service_name
    );

    // Setup graceful shutdown (SIGINT, SIGTERM, SIGHUP)
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        c.cancel();
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(runner::run(&config, source, cancel)) {
        Ok(stats) => {
            info!(
                "Shutdown complete: {} refresh cycles, {} collector failures",
                stats.refreshes, stats.refresh_failures
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("80G"), Ok(80 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("40960M"), Ok(40960 * 1024 * 1024));
        assert_eq!(parse_size("1024K"), Ok(1024 * 1024));
        assert_eq!(parse_size("512"), Ok(512));
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("99999999999999999999G").is_err());
        assert!(parse_size("18446744073709551615G").is_err());
    }

    #[test]
    fn test_build_config_nvidia_smi() {
        let args = Args::try_parse_from([
            "gpumond",
            "nvidia-smi-poll",
            "--interval",
            "30",
            "--api-key",
            "k",
            "--nvidia-smi",
            "/usr/bin/nvidia-smi",
        ])
        .unwrap();
        let (config, source) = build_config(&args);

        assert_eq!(source, Source::Snapshot);
        assert_eq!(config.export.interval, Duration::from_secs(30));
        assert_eq!(config.export.api_key.as_deref(), Some("k"));
        assert_eq!(config.snapshot.program, "/usr/bin/nvidia-smi");
        assert_eq!(config.snapshot.args, vec!["-q", "-x"]);
        assert_eq!(config.service_name, "gpu-mon");
    }

    #[test]
    fn test_build_config_dynolog() {
        let args = Args::try_parse_from([
            "gpumond",
            "dynolog-poll",
            "--memory-capacity",
            "40G",
            "--reporting-interval",
            "5",
            "--",
            "--port=1778",
        ])
        .unwrap();
        let (config, source) = build_config(&args);

        assert_eq!(source, Source::Stream);
        assert_eq!(config.stream.memory_capacity_bytes, 40 * 1024 * 1024 * 1024);
        assert_eq!(config.stream.reporting_interval_s, 5);
        assert_eq!(config.stream.extra_args, vec!["--port=1778"]);
        assert!(config.stream.args().contains(&"--port=1778".to_string()));
    }

    #[test]
    fn test_zero_interval_reaches_validation() {
        let args = Args::try_parse_from(["gpumond", "nvidia-smi-poll", "--interval", "0"]).unwrap();
        let (config, _) = build_config(&args);
        assert_eq!(config.export.interval, Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_api_key_is_none() {
        let args =
            Args::try_parse_from(["gpumond", "nvidia-smi-poll", "--api-key", ""]).unwrap();
        let (config, _) = build_config(&args);
        assert!(config.export.api_key.is_none());
    }
}
