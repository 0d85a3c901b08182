//! Retry manager routing: inline retries, DLQ moves, and cooldown
//! requeues

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;

use common::{payload, StubJobs, StubPublisher};
use eval_pipeline::clients::JobRepository;
use eval_pipeline::domain::{DlqJob, JobStatus, RetryInfo, RetryStatus};
use eval_pipeline::error::PipelineError;
use eval_pipeline::metrics::PipelineMetrics;
use eval_pipeline::queue::{RetryManager, RetryPolicy};

struct Fixture {
    publisher: Arc<StubPublisher>,
    jobs: Arc<StubJobs>,
    manager: Arc<RetryManager>,
}

fn fixture(policy: RetryPolicy) -> Fixture {
    let publisher = Arc::new(StubPublisher::default());
    let jobs = Arc::new(StubJobs::default());
    let manager = Arc::new(RetryManager::new(
        publisher.clone(),
        jobs.clone(),
        policy,
        Arc::new(PipelineMetrics::new()),
    ));
    Fixture {
        publisher,
        jobs,
        manager,
    }
}

fn dlq_job(last_error: &str, reason: &str, parked_secs_ago: i64) -> DlqJob {
    let mut retry_info = RetryInfo::new(3);
    retry_info.record_error(last_error);
    DlqJob {
        job_id: "J1".to_string(),
        original_payload: payload("J1"),
        retry_info,
        failure_reason: reason.to_string(),
        moved_to_dlq_at: Utc::now() - chrono::Duration::seconds(parked_secs_ago),
        can_be_reprocessed: true,
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_goes_straight_to_dlq_without_inline_retry() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    let task = payload("J1");
    let error = PipelineError::AiClient("upstream rate limit exceeded".to_string());

    fx.manager.handle_failure(&task, &error).await.unwrap();

    assert_eq!(fx.publisher.dlq_count(), 1);
    assert_eq!(fx.publisher.evaluate_count(), 0);
    let dlq = fx.publisher.last_dlq().unwrap();
    assert!(dlq.failure_reason.contains("rate limit"), "{}", dlq.failure_reason);
    assert_eq!(dlq.retry_info.retry_status, RetryStatus::Dlq);
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Failed));

    // give any stray timer a chance to fire: still no inline retry
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.publisher.evaluate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_goes_straight_to_dlq() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    let task = payload("J1");
    let error = PipelineError::AiClient("context deadline exceeded".to_string());

    fx.manager.handle_failure(&task, &error).await.unwrap();

    assert_eq!(fx.publisher.dlq_count(), 1);
    assert_eq!(fx.publisher.evaluate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn internal_error_retries_inline_after_backoff() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    let task = payload("J1");
    let error = PipelineError::Internal("disk on fire".to_string());

    fx.manager.handle_failure(&task, &error).await.unwrap();

    // scheduled, not yet published
    assert_eq!(fx.publisher.evaluate_count(), 0);
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Queued));
    let info = fx.manager.retry_info("J1").unwrap();
    assert_eq!(info.retry_status, RetryStatus::Retrying);
    assert_eq!(info.attempt_count, 1);
    assert!(info.next_retry_at.is_some());

    // let the retry timer fire (base 2s + jitter)
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.publisher.evaluate_count(), 1);
    assert_eq!(fx.publisher.dlq_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_retry_skips_jobs_that_moved_on() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    let task = payload("J1");

    fx.manager
        .handle_failure(&task, &PipelineError::Internal("boom".to_string()))
        .await
        .unwrap();

    // an operator (or another worker) completes the job before the timer
    fx.jobs
        .update_status("J1", JobStatus::Completed, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.publisher.evaluate_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_moves_to_dlq() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    let task = payload("J1");

    let mut retry_info = RetryInfo::new(3);
    retry_info.attempt_count = 3;
    retry_info.record_error("disk on fire");

    fx.manager
        .retry_job("J1", retry_info, &task)
        .await
        .unwrap();

    assert_eq!(fx.publisher.dlq_count(), 1);
    let dlq = fx.publisher.last_dlq().unwrap();
    assert!(
        dlq.failure_reason.contains("retry budget exhausted"),
        "{}",
        dlq.failure_reason
    );
    assert!(!dlq.can_be_reprocessed);
}

#[tokio::test(start_paused = true)]
async fn failed_retry_publish_marks_job_exhausted() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");
    fx.publisher.fail_evaluate.store(true, Ordering::SeqCst);
    let task = payload("J1");

    fx.manager
        .handle_failure(&task, &PipelineError::Internal("boom".to_string()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(fx.publisher.evaluate_count(), 0);
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Failed));
    assert_eq!(
        fx.jobs.error_of("J1").unwrap(),
        "failed to enqueue for retry"
    );
    let info = fx.manager.retry_info("J1").unwrap();
    assert_eq!(info.retry_status, RetryStatus::Exhausted);
}

#[tokio::test(start_paused = true)]
async fn dlq_cooldown_delays_requeue_of_timeout_failures() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");

    // parked 5 seconds ago with a timeout: 25 seconds of cooldown remain
    let job = dlq_job("timeout", "request timeout", 5);
    fx.manager.process_dlq_job(job).await.unwrap();

    // no immediate requeue
    assert_eq!(fx.publisher.evaluate_count(), 0);

    tokio::time::sleep(Duration::from_secs(26)).await;
    assert_eq!(fx.publisher.evaluate_count(), 1);
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Queued));
}

#[tokio::test(start_paused = true)]
async fn dlq_requeues_immediately_once_cooldown_elapsed() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");

    let job = dlq_job("upstream rate limit", "rate limit", 40);
    fx.manager.process_dlq_job(job).await.unwrap();

    assert_eq!(fx.publisher.evaluate_count(), 1);
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Queued));
}

#[tokio::test(start_paused = true)]
async fn dlq_requeues_non_throttle_failures_without_cooldown() {
    let fx = fixture(RetryPolicy::default());
    fx.jobs.seed_queued("J1");

    let job = dlq_job("schema invalid", "bad model output", 1);
    fx.manager.process_dlq_job(job).await.unwrap();

    assert_eq!(fx.publisher.evaluate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_reprocessable_dlq_jobs_are_rejected() {
    let fx = fixture(RetryPolicy::default());
    let mut job = dlq_job("timeout", "request timeout", 60);
    job.can_be_reprocessed = false;

    let err = fx.manager.process_dlq_job(job).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert_eq!(fx.publisher.evaluate_count(), 0);
}
