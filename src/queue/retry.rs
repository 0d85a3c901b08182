//! Failure routing: inline retries, DLQ moves, and cooldown requeues
//!
//! The retry manager decides what happens to a failed job: rate-limit and
//! timeout failures go straight to the DLQ so the upstream gets room to
//! breathe, everything else retries inline with exponential backoff until
//! the attempt budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clients::JobRepository;
use crate::domain::{DlqJob, EvaluateTaskPayload, JobStatus, RetryInfo, RetryStatus};
use crate::error::{classify_failure_code, PipelineError, Result};
use crate::metrics::PipelineMetrics;

use super::producer::TaskPublisher;

/// Cooling window applied to rate-limited and timed-out DLQ jobs
const DLQ_COOLDOWN: Duration = Duration::from_secs(30);
/// Failure texts that trigger the cooling window
const COOLDOWN_MARKERS: &[&str] = &["rate limit", "timeout", "deadline exceeded"];

/// Backoff shape for inline retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt budget before a job is parked
    pub max_retries: u32,
    /// First-retry delay
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt_count` consumed attempts
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt_count.min(30) as i32);
        let backed_off = if multiplier.is_finite() && multiplier < 1e6 {
            self.base_delay.mul_f64(multiplier)
        } else {
            self.max_delay
        };
        let capped = backed_off.min(self.max_delay);
        let jitter = capped.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        (capped + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}

/// Routes failed jobs to inline retry, the DLQ, or exhaustion.
///
/// Cheap to clone: clones share the publisher, repositories, and retry
/// bookkeeping, so retry timers can run in spawned tasks.
#[derive(Clone)]
pub struct RetryManager {
    publisher: Arc<dyn TaskPublisher>,
    jobs: Arc<dyn JobRepository>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    // Retry bookkeeping lives with the manager for the life of the
    // process; a job's entry is dropped once it completes or exhausts.
    state: Arc<Mutex<HashMap<String, RetryInfo>>>,
}

impl RetryManager {
    /// Manager publishing through `publisher` and recording job status
    /// through `jobs`
    pub fn new(
        publisher: Arc<dyn TaskPublisher>,
        jobs: Arc<dyn JobRepository>,
        policy: RetryPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            publisher,
            jobs,
            policy,
            metrics,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record `error` against the job and route it per policy.
    ///
    /// Entry point used by the consumer; fetches or creates the job's
    /// retry bookkeeping before delegating to [`retry_job`](Self::retry_job).
    pub async fn handle_failure(
        &self,
        payload: &EvaluateTaskPayload,
        error: &PipelineError,
    ) -> Result<()> {
        let retry_info = {
            let mut state = self.state.lock();
            let info = state
                .entry(payload.job_id.clone())
                .or_insert_with(|| RetryInfo::new(self.policy.max_retries));
            info.record_error(error.to_string());
            info.clone()
        };
        self.retry_job(&payload.job_id, retry_info, payload).await
    }

    /// Decide among inline retry, DLQ, and exhaustion for one failure
    pub async fn retry_job(
        &self,
        job_id: &str,
        mut retry_info: RetryInfo,
        payload: &EvaluateTaskPayload,
    ) -> Result<()> {
        let code = classify_failure_code(&retry_info.last_error);

        // Throttling and timeouts skip inline retry entirely: hammering a
        // saturated upstream only makes it worse. The DLQ consumer applies
        // the cooling window before requeueing.
        if code.is_upstream_pressure() {
            info!(job_id, code = %code, "routing upstream-pressure failure to DLQ");
            let reason = retry_info.last_error.clone();
            return self.move_to_dlq(job_id, payload, retry_info, &reason).await;
        }

        if !retry_info.should_retry() {
            let reason = format!(
                "retry budget exhausted after {} attempts: {}",
                retry_info.attempt_count, retry_info.last_error
            );
            return self.move_to_dlq(job_id, payload, retry_info, &reason).await;
        }

        let delay = self.policy.next_delay(retry_info.attempt_count);
        retry_info.retry_status = RetryStatus::Retrying;
        retry_info.attempt_count += 1;
        retry_info.next_retry_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        retry_info.updated_at = Utc::now();
        self.store(job_id, retry_info.clone());

        self.jobs
            .update_status(job_id, JobStatus::Queued, None)
            .await?;
        self.metrics.record_retry_scheduled();
        info!(
            job_id,
            attempt = retry_info.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "inline retry scheduled"
        );

        let manager = self.clone();
        let job_id = job_id.to_string();
        let payload = payload.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.run_scheduled_retry(&job_id, &payload).await;
        });
        Ok(())
    }

    /// Park a job on the DLQ topic and mark it failed
    pub async fn move_to_dlq(
        &self,
        job_id: &str,
        payload: &EvaluateTaskPayload,
        mut retry_info: RetryInfo,
        reason: &str,
    ) -> Result<()> {
        retry_info.retry_status = RetryStatus::Dlq;
        retry_info.updated_at = Utc::now();
        let can_be_reprocessed = retry_info.attempt_count < retry_info.max_attempts;
        self.store(job_id, retry_info.clone());

        let dlq_job = DlqJob {
            job_id: job_id.to_string(),
            original_payload: payload.clone(),
            retry_info,
            failure_reason: reason.to_string(),
            moved_to_dlq_at: Utc::now(),
            can_be_reprocessed,
        };

        self.publisher.enqueue_dlq(job_id, &dlq_job).await?;
        self.metrics.record_dlq_move();

        // Status update is best effort: the envelope is already durable.
        if let Err(e) = self
            .jobs
            .update_status(job_id, JobStatus::Failed, Some(reason))
            .await
        {
            warn!(job_id, error = %e, "failed to mark DLQ'd job as failed");
        }
        info!(job_id, reason, "job moved to DLQ");
        Ok(())
    }

    /// Handle one job read back from the DLQ topic.
    ///
    /// Rate-limit/timeout failures wait out the remainder of the cooling
    /// window (scheduled fire-and-forget); everything else requeues
    /// immediately. Non-reprocessable jobs are rejected.
    pub async fn process_dlq_job(&self, dlq_job: DlqJob) -> Result<()> {
        if !dlq_job.can_be_reprocessed {
            return Err(PipelineError::InvalidArgument(format!(
                "DLQ job {} is not eligible for reprocessing",
                dlq_job.job_id
            )));
        }

        if needs_cooldown(&dlq_job) {
            let parked_for = Utc::now()
                .signed_duration_since(dlq_job.moved_to_dlq_at)
                .to_std()
                .unwrap_or_default();
            if parked_for < DLQ_COOLDOWN {
                let remaining = DLQ_COOLDOWN - parked_for;
                info!(
                    job_id = %dlq_job.job_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "cooling down before DLQ requeue"
                );
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    if let Err(e) = manager.requeue_from_dlq(&dlq_job).await {
                        error!(job_id = %dlq_job.job_id, error = %e, "delayed DLQ requeue failed");
                    }
                });
                return Ok(());
            }
        }

        self.requeue_from_dlq(&dlq_job).await
    }

    /// Put a parked job back on the work topic
    pub async fn requeue_from_dlq(&self, dlq_job: &DlqJob) -> Result<()> {
        self.jobs
            .update_status(&dlq_job.job_id, JobStatus::Queued, None)
            .await?;
        self.publisher
            .enqueue_evaluate(&dlq_job.original_payload)
            .await?;
        self.metrics.record_dlq_requeue();
        info!(job_id = %dlq_job.job_id, "job requeued from DLQ");
        Ok(())
    }

    /// Drop a job's retry bookkeeping after it completes
    pub fn clear(&self, job_id: &str) {
        self.state.lock().remove(job_id);
    }

    /// Current retry bookkeeping for a job, if any
    pub fn retry_info(&self, job_id: &str) -> Option<RetryInfo> {
        self.state.lock().get(job_id).cloned()
    }

    fn store(&self, job_id: &str, info: RetryInfo) {
        self.state.lock().insert(job_id.to_string(), info);
    }

    async fn run_scheduled_retry(&self, job_id: &str, payload: &EvaluateTaskPayload) {
        // The job may have moved on while the timer slept (operator
        // action, duplicate delivery); only a still-queued job replays.
        match self.jobs.get(job_id).await {
            Ok(job) if job.status == JobStatus::Queued => {}
            Ok(job) => {
                debug!(job_id, status = %job.status, "skipping scheduled retry, job moved on");
                return;
            }
            Err(e) => {
                warn!(job_id, error = %e, "skipping scheduled retry, job lookup failed");
                return;
            }
        }

        if let Err(e) = self.publisher.enqueue_evaluate(payload).await {
            error!(job_id, error = %e, "retry enqueue failed, marking exhausted");
            if let Some(mut info) = self.retry_info(job_id) {
                info.retry_status = RetryStatus::Exhausted;
                info.updated_at = Utc::now();
                self.store(job_id, info);
            }
            if let Err(status_err) = self
                .jobs
                .update_status(
                    job_id,
                    JobStatus::Failed,
                    Some("failed to enqueue for retry"),
                )
                .await
            {
                error!(job_id, error = %status_err, "failed to mark job failed");
            }
        } else {
            self.metrics.record_retry_published();
        }
    }
}

fn needs_cooldown(dlq_job: &DlqJob) -> bool {
    let haystack = format!(
        "{} {}",
        dlq_job.failure_reason.to_lowercase(),
        dlq_job.retry_info.last_error.to_lowercase()
    );
    COOLDOWN_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}
