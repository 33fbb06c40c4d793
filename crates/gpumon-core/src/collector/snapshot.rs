//! Snapshot collector: one `nvidia-smi -q -x` invocation per poll.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::collector::nvsmi::parse_smi_log;
use crate::collector::{CollectError, GpuCollector};
use crate::config::SnapshotSourceConfig;
use crate::reading::GpuReading;

/// Collects readings by running a query command and parsing its XML output.
///
/// Holds no state between polls; every call spawns a fresh process, which
/// is killed if the call is cancelled or its future dropped.
pub struct SnapshotCollector {
    program: String,
    args: Vec<String>,
}

impl SnapshotCollector {
    pub fn new(config: &SnapshotSourceConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    /// Runs the query command and returns its stdout.
    async fn query(&self, cancel: &CancellationToken) -> Result<Vec<u8>, CollectError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollectError::Launch {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(CollectError::command_failed(
                &self.program,
                output.status,
                &output.stderr,
            ));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl GpuCollector for SnapshotCollector {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<GpuReading>, CollectError> {
        let start = Instant::now();
        let stdout = self.query(cancel).await?;
        let query_time = start.elapsed();

        let xml = std::str::from_utf8(&stdout)
            .map_err(|e| CollectError::Parse(format!("output is not UTF-8: {}", e)))?;
        let gpus = parse_smi_log(xml).map_err(|e| CollectError::Parse(e.to_string()))?;

        let readings: Vec<GpuReading> = gpus.iter().map(|g| g.to_reading()).collect();
        for r in &readings {
            trace!(
                gpu_id = r.device_id(),
                memory_used_bytes = r.memory_used_bytes(),
                utilization_percent = r.utilization_percent(),
                "nvidia-smi reading"
            );
        }
        debug!(
            devices = readings.len(),
            query_ms = query_time.as_millis() as u64,
            "nvidia-smi snapshot collected"
        );

        Ok(readings)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collector(program: &str, args: &[&str]) -> SnapshotCollector {
        SnapshotCollector::new(&SnapshotSourceConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn xml_file(content: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_collect_from_fake_command() {
        let file = xml_file(
            r#"<?xml version="1.0" ?>
<nvidia_smi_log>
    <gpu id="0">
        <product_name>Test-GPU</product_name>
        <fb_memory_usage><used>1024 MiB</used></fb_memory_usage>
        <utilization><gpu_util>42 %</gpu_util></utilization>
    </gpu>
</nvidia_smi_log>"#,
        );
        let c = collector("cat", &[file.path().to_str().unwrap()]);

        let readings = c.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id(), "0");
        assert_eq!(readings[0].device_name(), "Test-GPU");
        assert_eq!(readings[0].memory_used_bytes(), 1024 * 1024 * 1024);
        assert_eq!(readings[0].utilization_percent(), 42.0);
    }

    #[tokio::test]
    async fn test_empty_device_list() {
        let file = xml_file("<nvidia_smi_log><attached_gpus>0</attached_gpus></nvidia_smi_log>");
        let c = collector("cat", &[file.path().to_str().unwrap()]);
        assert!(c.collect(&CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_output_is_parse_error() {
        let file = xml_file("<nvidia_smi_log><gpu id=\"0\"><product_name>X</gpu>");
        let c = collector("cat", &[file.path().to_str().unwrap()]);
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let c = collector("sh", &["-c", "echo 'No devices were found' >&2; exit 6"]);
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        match err {
            CollectError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(6));
                assert_eq!(stderr, "No devices were found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let c = collector("/nonexistent/nvidia-smi", &[]);
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal(), "got {err}");
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_query() {
        let c = collector("sleep", &["30"]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = c.collect(&cancel).await.unwrap_err();
        assert!(matches!(err, CollectError::Cancelled), "got {err}");
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
