//! Refresh cache shared by the instrument callbacks.
//!
//! The SDK's periodic reader invokes one callback per instrument on every
//! collection, all from its own thread. The first callback of a collection
//! runs a refresh cycle through the gauge registry; the others reuse that
//! cycle's observations as long as they are younger than `max_age`. Refresh
//! cycles therefore never overlap, and a collector sees at most one
//! `collect` per export.
//!
//! Callbacks are synchronous, so the async refresh is driven with
//! [`Handle::block_on`]. This is only valid off the runtime's worker threads,
//! which holds for the reader thread and for `spawn_blocking` tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{GaugeRegistry, Instrument, Observation};

/// Counters describing a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Refresh cycles run.
    pub refreshes: u64,
    /// Collector failures across all cycles.
    pub refresh_failures: u64,
}

struct Cached {
    taken_at: Option<Instant>,
    observations: Arc<Vec<Observation>>,
    /// Upper bound for one whole refresh cycle.
    budget: Duration,
}

pub struct SharedRefresh {
    registry: Arc<GaugeRegistry>,
    handle: Handle,
    max_age: Duration,
    slow_after: Duration,
    cached: Mutex<Cached>,
    cancel: Mutex<CancellationToken>,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedRefresh {
    /// `interval` is the export interval: cached observations are reused
    /// for half of it, and a single cycle may take at most all of it.
    pub fn new(registry: Arc<GaugeRegistry>, handle: Handle, interval: Duration) -> Self {
        Self {
            registry,
            handle,
            max_age: interval / 2,
            slow_after: interval / 2,
            cached: Mutex::new(Cached {
                taken_at: None,
                observations: Arc::new(Vec::new()),
                budget: interval,
            }),
            cancel: Mutex::new(CancellationToken::new()),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
        }
    }

    /// Instruments to create callbacks for, in registration order.
    pub fn instruments(&self) -> Vec<Instrument> {
        self.registry.instruments()
    }

    /// Observations of the current cycle, refreshing first when stale.
    ///
    /// Blocks the calling thread for the duration of a refresh.
    pub fn observations(&self) -> Arc<Vec<Observation>> {
        let mut cached = lock(&self.cached);
        let fresh = cached
            .taken_at
            .is_some_and(|at| at.elapsed() < self.max_age);
        if fresh {
            return cached.observations.clone();
        }

        let token = lock(&self.cancel).clone();
        let budget = cached.budget;
        let t0 = Instant::now();
        let outcome = self.handle.block_on(async {
            tokio::time::timeout(budget, self.registry.refresh(&token)).await
        });
        let elapsed = t0.elapsed();

        let cycle = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        let observations = match outcome {
            Ok(outcome) => {
                self.refresh_failures
                    .fetch_add(outcome.failures.len() as u64, Ordering::Relaxed);
                outcome.observations
            }
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "refresh cycle abandoned");
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };

        if cycle == 1 {
            info!(
                duration_ms = elapsed.as_millis() as u64,
                observations = observations.len(),
                "first refresh cycle completed"
            );
        } else if elapsed > self.slow_after {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = (self.slow_after * 2).as_millis() as u64,
                "refresh cycle took more than half the export interval"
            );
        } else {
            debug!(
                duration_ms = elapsed.as_millis() as u64,
                cycle,
                observations = observations.len(),
                "refresh cycle completed"
            );
        }

        cached.taken_at = Some(Instant::now());
        cached.observations = Arc::new(observations);
        cached.observations.clone()
    }

    /// Forces the next [`observations`](Self::observations) call to refresh.
    pub fn invalidate(&self) {
        lock(&self.cached).taken_at = None;
    }

    /// Cancels an in-flight refresh; later refreshes run normally.
    pub fn interrupt(&self) {
        let mut token = lock(&self.cancel);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Prepares the final collection: the next call refreshes, bounded by
    /// `budget`.
    pub fn prepare_final(&self, budget: Duration) {
        self.interrupt();
        let mut cached = lock(&self.cached);
        cached.taken_at = None;
        cached.budget = cached.budget.min(budget);
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }
}
