//! gpumon-core — GPU telemetry collection engine.
//!
//! Provides:
//! - `reading` — canonical, source-agnostic GPU reading
//! - `normalize` — pure conversions for source-specific encodings
//! - `collector` — snapshot (`nvidia-smi`) and stream-tail (`dynolog`) collectors
//! - `registry` — gauge registry and per-collector refresh callbacks
//! - `export` — OpenTelemetry meter pipeline and OTLP/HTTP exporter
//! - `reader` — refresh cache shared by the instrument callbacks
//! - `runner` — process-lifetime collection runner
//! - `config` — explicit run configuration

pub mod collector;
pub mod config;
pub mod export;
pub mod normalize;
pub mod reader;
pub mod reading;
pub mod registry;
pub mod runner;

/// Crate version, shared by the daemon for `--version` and resource attributes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
