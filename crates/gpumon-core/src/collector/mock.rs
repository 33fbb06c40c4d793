//! Scripted collector for tests.
//!
//! Returns a fixed set of readings on every call unless an error has been
//! queued with [`FakeCollector::fail_next`]. Optional delay honours the
//! cancellation token like the real collectors do.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectError, GpuCollector};
use crate::reading::GpuReading;
use crate::registry::Instrument;

pub struct FakeCollector {
    name: &'static str,
    readings: Vec<GpuReading>,
    instruments: &'static [Instrument],
    queued_errors: Mutex<VecDeque<CollectError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    shut_down: AtomicBool,
}

impl FakeCollector {
    pub fn new(name: &'static str, readings: Vec<GpuReading>) -> Self {
        Self {
            name,
            readings,
            instruments: &[],
            queued_errors: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Two devices with distinct ids, names and values.
    pub fn two_devices() -> Self {
        Self::new(
            "fake",
            vec![
                GpuReading::new("0", "Test-GPU-A", 1024 * 1024 * 1024, 42.0),
                GpuReading::new("1", "Test-GPU-B", 512 * 1024 * 1024, 7.0),
            ],
        )
    }

    pub fn with_instruments(mut self, instruments: &'static [Instrument]) -> Self {
        self.instruments = instruments;
        self
    }

    /// Makes each call wait before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues an error for the next call.
    pub fn fail_next(&self, error: CollectError) {
        self.queued_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GpuCollector for FakeCollector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn instruments(&self) -> &'static [Instrument] {
        self.instruments
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<GpuReading>, CollectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let queued = self
            .queued_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match queued {
            Some(err) => Err(err),
            None => Ok(self.readings.clone()),
        }
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
