//! Pipeline counters and score histograms
//!
//! Lock-free counters updated on the hot path; the service layer reads a
//! point-in-time snapshot. Scores land in fixed-bucket histograms so the
//! health endpoint can show distribution without a metrics backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Histogram bucket count; scores are mapped linearly onto the range
const SCORE_BUCKETS: usize = 10;

/// Fixed-bucket histogram over a closed numeric range
#[derive(Debug)]
pub struct ScoreHistogram {
    min: f64,
    max: f64,
    buckets: [AtomicU64; SCORE_BUCKETS],
    count: AtomicU64,
    sum_milli: AtomicU64,
}

impl ScoreHistogram {
    /// Histogram over `[min, max]`
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_milli: AtomicU64::new(0),
        }
    }

    /// Record one observation, clamped into range
    pub fn record(&self, value: f64) {
        let clamped = value.clamp(self.min, self.max);
        let span = self.max - self.min;
        let idx = (((clamped - self.min) / span) * (SCORE_BUCKETS as f64 - 1.0)).round() as usize;
        self.buckets[idx.min(SCORE_BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_milli
            .fetch_add((clamped * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Snapshot of counts and mean
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let mean = if count > 0 {
            Some(self.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0 / count as f64)
        } else {
            None
        };
        HistogramSnapshot {
            count,
            mean,
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Point-in-time view of a histogram
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Observations recorded
    pub count: u64,
    /// Mean observation, if any were recorded
    pub mean: Option<f64>,
    /// Per-bucket counts, low to high
    pub buckets: Vec<u64>,
}

/// Counters and histograms shared across the pipeline
#[derive(Debug)]
pub struct PipelineMetrics {
    jobs_enqueued: AtomicU64,
    records_consumed: AtomicU64,
    records_processed: AtomicU64,
    records_failed: AtomicU64,
    fetch_errors: AtomicU64,
    queue_overflows: AtomicU64,
    retries_scheduled: AtomicU64,
    retries_published: AtomicU64,
    dlq_moves: AtomicU64,
    dlq_requeues: AtomicU64,
    tokens_total: AtomicU64,
    processing_ms_sum: AtomicU64,
    cv_match_rate: ScoreHistogram,
    project_score: ScoreHistogram,
}

impl PipelineMetrics {
    /// Fresh metrics, all zero
    pub fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            records_consumed: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            retries_published: AtomicU64::new(0),
            dlq_moves: AtomicU64::new(0),
            dlq_requeues: AtomicU64::new(0),
            tokens_total: AtomicU64::new(0),
            processing_ms_sum: AtomicU64::new(0),
            cv_match_rate: ScoreHistogram::new(0.0, 1.0),
            project_score: ScoreHistogram::new(1.0, 10.0),
        }
    }

    /// A task was published to the work topic
    pub fn record_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was fetched from the broker
    pub fn record_consumed(&self) {
        self.records_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was processed to completion
    pub fn record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// A record failed processing
    pub fn record_failed(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// The fetcher hit a transient broker error
    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A record bypassed the full job queue
    pub fn record_queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// An inline retry was scheduled
    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// A scheduled retry was re-published
    pub fn record_retry_published(&self) {
        self.retries_published.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was parked on the DLQ
    pub fn record_dlq_move(&self) {
        self.dlq_moves.fetch_add(1, Ordering::Relaxed);
    }

    /// A parked job was requeued
    pub fn record_dlq_requeue(&self) {
        self.dlq_requeues.fetch_add(1, Ordering::Relaxed);
    }

    /// Final scores of one completed evaluation
    pub fn record_scores(&self, cv_match_rate: f64, project_score: f64) {
        self.cv_match_rate.record(cv_match_rate);
        self.project_score.record(project_score);
    }

    /// Token usage of one model call
    pub fn record_tokens(&self, total_tokens: usize) {
        self.tokens_total
            .fetch_add(total_tokens as u64, Ordering::Relaxed);
    }

    /// Wall-clock duration of one evaluation
    pub fn record_processing_duration(&self, duration: Duration) {
        self.processing_ms_sum
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Point-in-time view of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retries_published: self.retries_published.load(Ordering::Relaxed),
            dlq_moves: self.dlq_moves.load(Ordering::Relaxed),
            dlq_requeues: self.dlq_requeues.load(Ordering::Relaxed),
            tokens_total: self.tokens_total.load(Ordering::Relaxed),
            processing_ms_sum: self.processing_ms_sum.load(Ordering::Relaxed),
            cv_match_rate: self.cv_match_rate.snapshot(),
            project_score: self.project_score.snapshot(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized counter state for the metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub records_consumed: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub fetch_errors: u64,
    pub queue_overflows: u64,
    pub retries_scheduled: u64,
    pub retries_published: u64,
    pub dlq_moves: u64,
    pub dlq_requeues: u64,
    pub tokens_total: u64,
    pub processing_ms_sum: u64,
    pub cv_match_rate: HistogramSnapshot,
    pub project_score: HistogramSnapshot,
}
