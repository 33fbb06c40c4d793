//! Stream-tail collector: tails a long-lived `dynolog` process's stderr.
//!
//! The monitor process is started once and lives for the whole run. Each
//! `collect` advances a line cursor over its stderr until the next
//! `data = {...}` line, then drains whatever is already buffered and keeps
//! the latest record per device. Reads are cancellable and the cursor never
//! moves backwards, so consecutive calls never see the same line twice.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::dcgm::{self, DcgmRecord};
use crate::collector::{CollectError, GpuCollector};
use crate::config::StreamSourceConfig;
use crate::reading::GpuReading;
use crate::registry::Instrument;

type LineCursor = Lines<BufReader<Pin<Box<dyn AsyncRead + Send>>>>;

/// Collects readings from a continuously running monitor process.
///
/// The child is spawned with `kill_on_drop`, so it cannot outlive the
/// collector even when [`GpuCollector::shutdown`] is never reached.
pub struct StreamTailCollector {
    cursor: Mutex<LineCursor>,
    child: Mutex<Option<Child>>,
    program: String,
    memory_capacity_bytes: u64,
    lines_read: AtomicU64,
}

impl StreamTailCollector {
    /// Starts the configured monitor process.
    pub fn start(config: &StreamSourceConfig) -> Result<Self, CollectError> {
        Self::spawn(&config.program, &config.args(), config.memory_capacity_bytes)
    }

    /// Spawns `program` and attaches the cursor to its stderr.
    ///
    /// Fails only if the process cannot be launched; later misbehaviour of
    /// the process surfaces through `collect`.
    pub fn spawn(
        program: &str,
        args: &[String],
        memory_capacity_bytes: u64,
    ) -> Result<Self, CollectError> {
        let launch_err = |source| CollectError::Launch {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_err(std::io::Error::other("stderr not captured")))?;

        info!(program, pid = child.id(), "monitor process started");

        let mut collector = Self::from_reader(stderr, memory_capacity_bytes);
        collector.program = program.to_string();
        collector.child = Mutex::new(Some(child));
        Ok(collector)
    }

    /// Attaches the cursor to an existing byte stream; no process is owned.
    pub fn from_reader<R>(reader: R, memory_capacity_bytes: u64) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(reader);
        Self {
            cursor: Mutex::new(BufReader::new(reader).lines()),
            child: Mutex::new(None),
            program: String::from("<reader>"),
            memory_capacity_bytes,
            lines_read: AtomicU64::new(0),
        }
    }

    /// Number of lines consumed from the stream so far.
    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    /// Kills and reaps the monitor process. Returns its exit status, or
    /// `None` if no process is owned or it was already terminated.
    pub async fn terminate(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await.take()?;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(program = %self.program, %status, "monitor process already exited");
            return Some(status);
        }

        if let Err(e) = child.kill().await {
            warn!(program = %self.program, error = %e, "failed to kill monitor process");
            return None;
        }

        match child.wait().await {
            Ok(status) => {
                info!(program = %self.program, %status, "monitor process stopped");
                Some(status)
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to reap monitor process");
                None
            }
        }
    }

    /// Counts and echoes one stream line; returns a reading for data lines.
    fn record_from_line(&self, line: &str) -> Option<Result<GpuReading, serde_json::Error>> {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
        info!(target: "gpumon::dynolog", "{}", line);

        let payload = dcgm::match_data_line(line)?;
        Some(DcgmRecord::parse(payload).map(|record| record.to_reading(self.memory_capacity_bytes)))
    }

    async fn log_exit_status(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            warn!(program = %self.program, %status, "monitor process exited");
        }
    }
}

#[async_trait]
impl GpuCollector for StreamTailCollector {
    fn name(&self) -> &'static str {
        "dynolog"
    }

    fn instruments(&self) -> &'static [Instrument] {
        dcgm::INSTRUMENTS
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<GpuReading>, CollectError> {
        let mut cursor = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            guard = self.cursor.lock() => guard,
        };

        let first = loop {
            // `next_line` is cancel-safe: a line is either returned or left buffered.
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                line = cursor.next_line() => line?,
            };

            let Some(line) = line else {
                drop(cursor);
                self.log_exit_status().await;
                return Err(CollectError::StreamEnded);
            };

            if let Some(record) = self.record_from_line(&line) {
                break record.map_err(|e| CollectError::Parse(format!("dcgm record: {}", e)))?;
            }
        };

        let mut latest = BTreeMap::new();
        latest.insert(first.device_id().to_string(), first);

        // Drain lines already buffered, without waiting; latest record per device wins.
        loop {
            let line = tokio::select! {
                biased;
                line = cursor.next_line() => line,
                _ = std::future::ready(()) => break,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(program = %self.program, error = %e, "stream read failed while draining");
                    break;
                }
            };

            match self.record_from_line(&line) {
                Some(Ok(reading)) => {
                    latest.insert(reading.device_id().to_string(), reading);
                }
                Some(Err(e)) => warn!(program = %self.program, error = %e, "skipping malformed dcgm record"),
                None => {}
            }
        }

        Ok(latest.into_values().collect())
    }

    async fn shutdown(&self) {
        self.terminate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;

    fn from_text(text: &str) -> StreamTailCollector {
        StreamTailCollector::from_reader(Cursor::new(text.as_bytes().to_vec()), 1000)
    }

    #[tokio::test]
    async fn test_skips_noise_and_parses_data_line() {
        let c = from_text(
            "I1019 10:00:00 dynolog starting\n\
             data = {\"device\":0,\"sm_active_ratio\":\"0.5\",\"gpu_memory_utilization\":10}\n",
        );
        let readings = c.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].device_id(), "0");
        assert_eq!(readings[0].utilization_percent(), 50.0);
        assert_eq!(readings[0].memory_used_bytes(), 100);
        assert_eq!(c.lines_read(), 2);
    }

    #[tokio::test]
    async fn test_noise_then_close_is_stream_ended() {
        let c = from_text("noise 1\nnoise 2\n");
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectError::StreamEnded), "got {err}");

        // Stays ended.
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectError::StreamEnded), "got {err}");
    }

    #[tokio::test]
    async fn test_cursor_only_moves_forward() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let c = StreamTailCollector::from_reader(rx, 1000);
        let cancel = CancellationToken::new();

        tx.write_all(b"data = {\"device\":0}\nnoise\n").await.unwrap();
        let first = c.collect(&cancel).await.unwrap();

        tx.write_all(b"data = {\"device\":1}\n").await.unwrap();
        let second = c.collect(&cancel).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].device_id(), "0");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].device_id(), "1");
        assert_eq!(c.lines_read(), 3);

        drop(tx);
        assert!(matches!(
            c.collect(&cancel).await.unwrap_err(),
            CollectError::StreamEnded
        ));
    }

    #[tokio::test]
    async fn test_drains_buffered_records_latest_per_device() {
        let c = from_text(
            "data = {\"device\":0,\"sm_active_ratio\":\"0.1\"}\n\
             data = {\"device\":1,\"sm_active_ratio\":\"0.2\"}\n\
             noise\n\
             data = {\"device\":\n\
             data = {\"device\":0,\"sm_active_ratio\":\"0.3\"}\n",
        );
        let readings = c.collect(&CancellationToken::new()).await.unwrap();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].device_id(), "0");
        assert_eq!(readings[0].utilization_percent(), 30.0);
        assert_eq!(readings[1].device_id(), "1");
        assert_eq!(readings[1].utilization_percent(), 20.0);
        assert_eq!(c.lines_read(), 5);
    }

    #[tokio::test]
    async fn test_malformed_json_consumes_line() {
        let c = from_text(
            "data = {\"device\":\n\
             data = {\"device\":4}\n",
        );
        let cancel = CancellationToken::new();
        let err = c.collect(&cancel).await.unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)), "got {err}");

        let readings = c.collect(&cancel).await.unwrap();
        assert_eq!(readings[0].device_id(), "4");
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_keeps_position() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let c = StreamTailCollector::from_reader(rx, 1000);

        tx.write_all(b"waiting for dcgm\n").await.unwrap();

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
        assert_eq!(c.lines_read(), 1);

        tx.write_all(b"data = {\"device\":7}\n").await.unwrap();
        let readings = c.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(readings[0].device_id(), "7");
        assert_eq!(c.lines_read(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_process_is_terminated() {
        let script = r#"echo 'data = {"device":3,"sm_active_ratio":"0.25"}' >&2; exec sleep 30"#;
        let c = StreamTailCollector::spawn("sh", &["-c".to_string(), script.to_string()], 1000)
            .unwrap();

        let readings = c.collect(&CancellationToken::new()).await.unwrap();
        assert_eq!(readings[0].device_id(), "3");
        assert_eq!(readings[0].utilization_percent(), 25.0);

        let status = c.terminate().await.expect("child should be owned");
        assert!(!status.success());

        // Second shutdown is a no-op.
        assert!(c.terminate().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_ends_stream() {
        let c = StreamTailCollector::spawn("sh", &["-c".to_string(), "echo boot >&2".to_string()], 0)
            .unwrap();
        let err = c.collect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectError::StreamEnded), "got {err}");
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let err = StreamTailCollector::spawn("/nonexistent/dynolog", &[], 0)
            .err()
            .unwrap();
        assert!(err.is_fatal(), "got {err}");
    }
}
