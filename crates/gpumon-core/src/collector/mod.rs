//! GPU metrics collectors.
//!
//! Two structurally different sources converge on [`GpuReading`] behind a
//! single [`GpuCollector`] capability.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     GpuCollector (trait)                     │
//! │   collect(cancel) -> Vec<GpuReading>                         │
//! └──────────────┬───────────────────────────────┬───────────────┘
//!                │                               │
//!     ┌──────────▼──────────┐         ┌──────────▼──────────┐
//!     │  SnapshotCollector  │         │ StreamTailCollector │
//!     │  nvidia-smi -q -x   │         │ dynolog (stderr)    │
//!     │  spawn per call     │         │ long-lived child    │
//!     └──────────┬──────────┘         └──────────┬──────────┘
//!                │                               │
//!         ┌──────▼──────┐                 ┌──────▼──────┐
//!         │   nvsmi     │                 │    dcgm     │
//!         │ XML parser  │                 │ line match  │
//!         └─────────────┘                 │ JSON record │
//!                                         └─────────────┘
//! ```
//!
//! Both variants honour the cancellation token passed to `collect`: the
//! snapshot query is killed, the stream read is abandoned without losing
//! its place in the stream.
//!
//! # Testing
//!
//! ```
//! use gpumon_core::collector::{FakeCollector, GpuCollector};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let collector = FakeCollector::two_devices();
//! let readings = collector.collect(&CancellationToken::new()).await.unwrap();
//! assert_eq!(readings.len(), 2);
//! # });
//! ```

pub mod dcgm;
pub mod mock;
pub mod nvsmi;
mod snapshot;
mod stream;

use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::reading::GpuReading;
use crate::registry::Instrument;

pub use mock::FakeCollector;
pub use snapshot::SnapshotCollector;
pub use stream::StreamTailCollector;

/// Maximum number of stderr bytes kept in [`CollectError::CommandFailed`].
const MAX_STDERR_LEN: usize = 512;

/// Error from a single collection attempt.
#[derive(Debug)]
pub enum CollectError {
    /// The external command could not be started.
    Launch {
        program: String,
        source: std::io::Error,
    },
    /// The external command ran but exited unsuccessfully.
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    /// I/O error while reading command output.
    Io(std::io::Error),
    /// Output could not be parsed.
    Parse(String),
    /// The monitored stream closed before a reading arrived.
    StreamEnded,
    /// The caller cancelled the collection.
    Cancelled,
    /// The collection did not finish within the refresh deadline.
    Timeout(Duration),
}

impl CollectError {
    pub(crate) fn command_failed(program: &str, status: ExitStatus, stderr: &[u8]) -> Self {
        let mut stderr = String::from_utf8_lossy(stderr).trim().to_string();
        if stderr.len() > MAX_STDERR_LEN {
            let mut cut = MAX_STDERR_LEN;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        CollectError::CommandFailed {
            program: program.to_string(),
            status,
            stderr,
        }
    }

    /// Returns true for errors that make a collector unusable for the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectError::Launch { .. })
    }
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Launch { program, source } => {
                write!(f, "failed to start '{}': {}", program, source)
            }
            CollectError::CommandFailed {
                program,
                status,
                stderr,
            } => {
                write!(f, "'{}' exited with {}", program, status)?;
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
            CollectError::StreamEnded => write!(f, "stream ended before a reading was found"),
            CollectError::Cancelled => write!(f, "collection cancelled"),
            CollectError::Timeout(d) => write!(f, "collection timed out after {:?}", d),
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectError::Launch { source, .. } => Some(source),
            CollectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

/// A source of GPU readings.
///
/// Implementations may keep state between calls but must tolerate being
/// polled from a single task at a time; the registry never overlaps two
/// `collect` calls on the same collector.
#[async_trait]
pub trait GpuCollector: Send + Sync {
    /// Short name used in logs and as the `collector` attribute.
    fn name(&self) -> &'static str;

    /// Source-specific instruments reported through [`GpuReading::details`].
    fn instruments(&self) -> &'static [Instrument] {
        &[]
    }

    /// Acquires the current readings. Returns promptly with
    /// [`CollectError::Cancelled`] once `cancel` fires.
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<GpuReading>, CollectError>;

    /// Releases resources owned for the run (subprocesses). Idempotent.
    async fn shutdown(&self) {}
}
