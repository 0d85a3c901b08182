//! Collaborator interfaces consumed by the pipeline
//!
//! The database, the LLM provider and the vector store are external
//! services; the pipeline only ever talks to them through these traits,
//! shared as `Arc<dyn …>`. Implementations must be safe for concurrent
//! calls — the worker pool invokes them from many tasks at once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EvalResult, Job, JobStatus, Upload};
use crate::error::Result;

/// Transactional store for job lifecycle state
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Transition a job to `status`, optionally recording a diagnostic
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Fetch a job by id
    async fn get(&self, job_id: &str) -> Result<Job>;
}

/// Read-only access to uploaded artifacts
#[async_trait]
pub trait UploadRepository: Send + Sync {
    /// Fetch an upload by id
    async fn get(&self, id: &str) -> Result<Upload>;
}

/// Idempotent sink for evaluation results
#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Upsert keyed on `result.job_id`; replaying the same result is a no-op
    async fn upsert(&self, result: &EvalResult) -> Result<()>;
}

/// Remote LLM service
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Embed a batch of texts
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// One chat completion expected to honor the prompt's output format
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
    ) -> Result<String>;

    /// Like [`chat_json`](Self::chat_json) but the provider retries
    /// malformed output internally before surfacing an error
    async fn chat_json_with_retry(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
    ) -> Result<String>;

    /// Strip chain-of-thought reasoning from a response, leaving only the
    /// final answer text
    async fn clean_cot_response(&self, text: &str) -> Result<String>;
}

/// One match from the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Stored payload of the matched point
    pub payload: SearchPayload,
    /// Similarity score
    #[serde(default)]
    pub score: f32,
}

/// Payload carried by a vector-store point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPayload {
    /// The indexed text chunk
    pub text: String,
}

/// Remote semantic search service
#[async_trait]
pub trait VectorClient: Send + Sync {
    /// Top-k nearest points in `collection`
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>>;
}
