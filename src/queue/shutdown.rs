//! Graceful shutdown bookkeeping for the consumer

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Tracks shutdown progress and in-flight jobs.
///
/// Workers bracket every record with [`add_inflight_job`] /
/// [`remove_inflight_job`]; shutdown waits for the count to drain within
/// a bounded window before tearing the session down.
///
/// [`add_inflight_job`]: ShutdownState::add_inflight_job
/// [`remove_inflight_job`]: ShutdownState::remove_inflight_job
#[derive(Debug, Default)]
pub struct ShutdownState {
    shutting_down: AtomicBool,
    inflight_jobs: AtomicUsize,
}

impl ShutdownState {
    /// Fresh state, not shutting down, nothing in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as initiated
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("shutdown initiated");
        }
    }

    /// Whether shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Record one job entering processing
    pub fn add_inflight_job(&self) {
        let count = self.inflight_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(inflight = count, "job in flight");
    }

    /// Record one job leaving processing
    pub fn remove_inflight_job(&self) {
        self.inflight_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current in-flight count
    pub fn inflight_count(&self) -> usize {
        self.inflight_jobs.load(Ordering::SeqCst)
    }

    /// Wait until all in-flight jobs complete, up to `timeout`.
    ///
    /// Returns the number of jobs still in flight when the wait ended
    /// (zero on a clean drain).
    pub async fn wait_for_drain(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut last_reported = None;
        while self.inflight_count() > 0 && Instant::now() < deadline {
            let current = self.inflight_count();
            if last_reported != Some(current) {
                info!(inflight = current, "waiting for in-flight jobs to drain");
                last_reported = Some(current);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inflight_count()
    }
}
