//! Wire and persistence shapes shared across the pipeline
//!
//! Everything here is serde-derived; the JSON field names are the wire
//! contract for the `evaluate-jobs` and `dlq-jobs` topics and must not
//! drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most recent errors kept per job; older entries are dropped
const MAX_ERROR_HISTORY: usize = 10;

/// Immutable evaluation task, the body of every `evaluate-jobs` record.
///
/// `job_id` doubles as the broker partition key, so all records for one
/// job land on the same partition and keep their relative order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateTaskPayload {
    /// Globally unique job identifier and partition key
    pub job_id: String,
    /// Upload id of the CV under evaluation
    pub cv_id: String,
    /// Upload id of the project report under evaluation
    pub project_id: String,
    /// Free-text job description the CV is matched against
    pub job_description: String,
    /// Study case the project is evaluated against
    pub study_case_brief: String,
    /// Scoring rubric injected into the evaluation prompts
    pub scoring_rubric: String,
    /// Correlation id threaded through logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Lifecycle status of a persisted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for a worker
    Queued,
    /// Picked up by a worker
    Processing,
    /// Result persisted
    Completed,
    /// Terminal failure (retry manager may flip back to `Queued`)
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persistent job record, owned by the job repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier, same value as the payload `job_id`
    pub id: String,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Short diagnostic set when the job fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last status-change timestamp
    pub updated_at: DateTime<Utc>,
    /// Optional caller-supplied idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Kind of an uploaded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    /// Candidate CV text
    Cv,
    /// Project report text
    Project,
}

/// Uploaded artifact, read-only from the pipeline's perspective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    /// Upload identifier
    pub id: String,
    /// Artifact kind
    #[serde(rename = "type")]
    pub kind: UploadKind,
    /// Extracted plain text
    pub text: String,
}

/// Persisted evaluation outcome, upserted idempotently on `job_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Owning job id, unique per result
    pub job_id: String,
    /// CV-to-job match rate in `[0.0, 1.0]`
    pub cv_match_rate: f64,
    /// Project score in `[1.0, 10.0]`
    pub project_score: f64,
    /// Narrative feedback on the CV match
    pub cv_feedback: String,
    /// Narrative feedback on the project
    pub project_feedback: String,
    /// One-paragraph overall summary
    pub overall_summary: String,
    /// Persistence timestamp
    pub created_at: DateTime<Utc>,
}

/// Where a job currently sits in the retry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    /// Never retried
    None,
    /// An inline retry is scheduled
    Retrying,
    /// Parked on the DLQ topic
    Dlq,
    /// Retry budget spent, no further attempts
    Exhausted,
}

/// Retry bookkeeping for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryInfo {
    /// Attempts consumed so far
    pub attempt_count: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Most recent error text
    pub last_error: String,
    /// Bounded history of error texts, most recent last
    pub error_history: Vec<String>,
    /// Current retry lifecycle position
    pub retry_status: RetryStatus,
    /// When the next inline retry fires, if one is scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// First-failure timestamp
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp
    pub updated_at: DateTime<Utc>,
}

impl RetryInfo {
    /// Fresh retry state with the given attempt budget
    pub fn new(max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            attempt_count: 0,
            max_attempts,
            last_error: String::new(),
            error_history: Vec::new(),
            retry_status: RetryStatus::None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record an error, keeping the history bounded
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.last_error = error.clone();
        self.error_history.push(error);
        if self.error_history.len() > MAX_ERROR_HISTORY {
            let overflow = self.error_history.len() - MAX_ERROR_HISTORY;
            self.error_history.drain(..overflow);
        }
        self.updated_at = Utc::now();
    }

    /// Whether the generic policy still allows another attempt
    pub fn should_retry(&self) -> bool {
        !matches!(
            self.retry_status,
            RetryStatus::Exhausted | RetryStatus::Dlq
        ) && self.attempt_count < self.max_attempts
    }
}

/// Envelope body parked on the `dlq-jobs` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqJob {
    /// Owning job id
    pub job_id: String,
    /// The original task, replayed verbatim on requeue
    pub original_payload: EvaluateTaskPayload,
    /// Retry bookkeeping at the time of the move
    pub retry_info: RetryInfo,
    /// Why the job was parked
    pub failure_reason: String,
    /// When the job was parked; cooldowns are measured from here
    pub moved_to_dlq_at: DateTime<Utc>,
    /// Operator gate: `false` means the job stays parked
    pub can_be_reprocessed: bool,
}

/// Outer wire envelope for `dlq-jobs` records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// Owning job id, duplicated from the inner job for header routing
    pub job_id: String,
    /// The parked job
    pub dlq_data: DlqJob,
    /// Publish timestamp
    pub timestamp: DateTime<Utc>,
    /// Envelope discriminator, always `"dlq_job"`
    #[serde(rename = "type")]
    pub kind: String,
}

impl DlqEnvelope {
    /// Discriminator value for DLQ envelopes
    pub const KIND: &'static str = "dlq_job";

    /// Wrap a parked job for publishing
    pub fn new(dlq_data: DlqJob) -> Self {
        Self {
            job_id: dlq_data.job_id.clone(),
            dlq_data,
            timestamp: Utc::now(),
            kind: Self::KIND.to_string(),
        }
    }
}

/// Prompt/completion token accounting for one model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt messages, including chat overhead
    pub prompt_tokens: usize,
    /// Tokens in the completion
    pub completion_tokens: usize,
    /// Always `prompt_tokens + completion_tokens`
    pub total_tokens: usize,
    /// Model the counts were computed for
    pub model: String,
    /// Provider the call was billed against
    pub provider: String,
}
