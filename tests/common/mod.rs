//! Shared in-memory stand-ins for the pipeline's collaborators
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use eval_pipeline::clients::{
    AiClient, JobRepository, ResultRepository, SearchHit, SearchPayload, UploadRepository,
    VectorClient,
};
use eval_pipeline::domain::{
    DlqJob, EvalResult, EvaluateTaskPayload, Job, JobStatus, Upload, UploadKind,
};
use eval_pipeline::error::{PipelineError, Result};
use eval_pipeline::queue::TaskPublisher;

/// A payload with the given job id and matching upload ids
pub fn payload(job_id: &str) -> EvaluateTaskPayload {
    EvaluateTaskPayload {
        job_id: job_id.to_string(),
        cv_id: format!("cv-{job_id}"),
        project_id: format!("project-{job_id}"),
        job_description: "Rust backend engineer".to_string(),
        study_case_brief: "Build a resilient queue consumer".to_string(),
        scoring_rubric: "Correctness weighs the most".to_string(),
        request_id: Some(format!("req-{job_id}")),
    }
}

/// Job store recording every status transition
#[derive(Default)]
pub struct StubJobs {
    jobs: Mutex<HashMap<String, Job>>,
    transitions: Mutex<Vec<(String, JobStatus, Option<String>)>>,
}

impl StubJobs {
    pub fn seed_queued(&self, job_id: &str) {
        let now = Utc::now();
        self.jobs.lock().insert(
            job_id.to_string(),
            Job {
                id: job_id.to_string(),
                status: JobStatus::Queued,
                error_message: None,
                created_at: now,
                updated_at: now,
                idempotency_key: None,
            },
        );
    }

    pub fn status_of(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().get(job_id).map(|job| job.status)
    }

    pub fn error_of(&self, job_id: &str) -> Option<String> {
        self.jobs
            .lock()
            .get(job_id)
            .and_then(|job| job.error_message.clone())
    }

    pub fn transitions_of(&self, job_id: &str) -> Vec<JobStatus> {
        self.transitions
            .lock()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, status, _)| *status)
            .collect()
    }
}

#[async_trait]
impl JobRepository for StubJobs {
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.transitions.lock().push((
            job_id.to_string(),
            status,
            error_message.map(str::to_string),
        ));
        let mut jobs = self.jobs.lock();
        let now = Utc::now();
        let job = jobs.entry(job_id.to_string()).or_insert_with(|| Job {
            id: job_id.to_string(),
            status,
            error_message: None,
            created_at: now,
            updated_at: now,
            idempotency_key: None,
        });
        job.status = status;
        job.error_message = error_message.map(str::to_string);
        job.updated_at = now;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id} not found")))
    }
}

/// Upload store seeded per test
#[derive(Default)]
pub struct StubUploads {
    uploads: Mutex<HashMap<String, Upload>>,
}

impl StubUploads {
    pub fn insert(&self, id: &str, kind: UploadKind, text: &str) {
        self.uploads.lock().insert(
            id.to_string(),
            Upload {
                id: id.to_string(),
                kind,
                text: text.to_string(),
            },
        );
    }

    /// Seed both uploads referenced by [`payload`]
    pub fn seed_for(&self, task: &EvaluateTaskPayload) {
        self.insert(&task.cv_id, UploadKind::Cv, "Five years of Rust and Kafka.");
        self.insert(
            &task.project_id,
            UploadKind::Project,
            "A queue consumer with retries and a DLQ.",
        );
    }
}

#[async_trait]
impl UploadRepository for StubUploads {
    async fn get(&self, id: &str) -> Result<Upload> {
        self.uploads
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("upload {id} not found")))
    }
}

/// Result sink recording every upsert
#[derive(Default)]
pub struct StubResults {
    upserts: Mutex<Vec<EvalResult>>,
}

impl StubResults {
    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().len()
    }

    pub fn last(&self) -> Option<EvalResult> {
        self.upserts.lock().last().cloned()
    }
}

#[async_trait]
impl ResultRepository for StubResults {
    async fn upsert(&self, result: &EvalResult) -> Result<()> {
        self.upserts.lock().push(result.clone());
        Ok(())
    }
}

/// AI client following a script of chat responses
#[derive(Default)]
pub struct StubAi {
    chat_script: Mutex<VecDeque<Result<String>>>,
    cot_response: Mutex<Option<String>>,
    pub chat_calls: AtomicUsize,
    pub cot_calls: AtomicUsize,
}

impl StubAi {
    /// Queue responses consumed in order by `chat_json` and
    /// `chat_json_with_retry`
    pub fn script(self, responses: Vec<Result<String>>) -> Self {
        *self.chat_script.lock() = responses.into();
        self
    }

    /// Response returned by `clean_cot_response`
    pub fn cot(self, response: &str) -> Self {
        *self.cot_response.lock() = Some(response.to_string());
        self
    }

    fn next_chat(&self) -> Result<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.chat_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::AiClient("no scripted response".to_string())))
    }
}

#[async_trait]
impl AiClient for StubAi {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.1; 4]).collect())
    }

    async fn chat_json(&self, _system: &str, _user: &str, _max_tokens: usize) -> Result<String> {
        self.next_chat()
    }

    async fn chat_json_with_retry(
        &self,
        _system: &str,
        _user: &str,
        _max_tokens: usize,
    ) -> Result<String> {
        self.next_chat()
    }

    async fn clean_cot_response(&self, text: &str) -> Result<String> {
        self.cot_calls.fetch_add(1, Ordering::SeqCst);
        match self.cot_response.lock().clone() {
            Some(response) => Ok(response),
            None => Ok(text.to_string()),
        }
    }
}

/// Vector client returning one fixed hit per search
#[derive(Default)]
pub struct StubVector {
    pub searches: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl VectorClient for StubVector {
    async fn search(
        &self,
        collection: &str,
        _vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.searches.lock().push((collection.to_string(), top_k));
        Ok(vec![SearchHit {
            payload: SearchPayload {
                text: format!("context from {collection}"),
            },
            score: 0.9,
        }])
    }
}

/// Publisher recording publishes instead of talking to a broker
#[derive(Default)]
pub struct StubPublisher {
    evaluate_published: Mutex<Vec<EvaluateTaskPayload>>,
    dlq_published: Mutex<Vec<(String, DlqJob)>>,
    pub fail_evaluate: AtomicBool,
}

impl StubPublisher {
    pub fn evaluate_count(&self) -> usize {
        self.evaluate_published.lock().len()
    }

    pub fn dlq_count(&self) -> usize {
        self.dlq_published.lock().len()
    }

    pub fn last_dlq(&self) -> Option<DlqJob> {
        self.dlq_published
            .lock()
            .last()
            .map(|(_, job)| job.clone())
    }
}

#[async_trait]
impl TaskPublisher for StubPublisher {
    async fn enqueue_evaluate(&self, payload: &EvaluateTaskPayload) -> Result<String> {
        if self.fail_evaluate.load(Ordering::SeqCst) {
            return Err(PipelineError::Kafka(rdkafka::error::KafkaError::Canceled));
        }
        self.evaluate_published.lock().push(payload.clone());
        Ok(payload.job_id.clone())
    }

    async fn enqueue_dlq(&self, job_id: &str, dlq_job: &DlqJob) -> Result<()> {
        self.dlq_published
            .lock()
            .push((job_id.to_string(), dlq_job.clone()));
        Ok(())
    }
}
