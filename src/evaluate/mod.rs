//! Evaluation orchestrator
//!
//! Turns one [`EvaluateTaskPayload`] into one persisted [`EvalResult`]
//! and a terminal job status. The multi-step chain (CV match → project
//! evaluation → refinement → validation) runs up to three times with
//! backoff; when it keeps failing, a single fast-path prompt asks for the
//! canonical JSON directly. The whole job runs under a five-minute
//! budget.

pub mod prompts;
pub mod rag;
pub mod repair;

pub use repair::{CanonicalScores, ResponseRepairer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clients::{AiClient, JobRepository, ResultRepository, UploadRepository, VectorClient};
use crate::domain::{EvalResult, EvaluateTaskPayload, JobStatus};
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::queue::EvaluateHandler;
use crate::tokens::TokenCounter;

use rag::RagContext;

/// Placeholder when the model gives no CV feedback
const EMPTY_CV_FEEDBACK: &str = "No CV feedback provided.";
/// Placeholder when the model gives no project feedback
const EMPTY_PROJECT_FEEDBACK: &str = "No project feedback provided.";
/// Placeholder when the model gives no summary
const EMPTY_SUMMARY: &str = "No summary provided.";

/// Tuning knobs of the orchestrator
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Wall-clock budget for one job
    pub processing_budget: Duration,
    /// Attempts of the multi-step chain before the fast path
    pub max_chain_attempts: u32,
    /// Completion budget per chain step
    pub step_max_tokens: usize,
    /// Model name used for prompts and token accounting
    pub model: String,
    /// Provider name used for token accounting
    pub provider: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            processing_budget: Duration::from_secs(300),
            max_chain_attempts: 3,
            step_max_tokens: 2048,
            model: "gpt-4".to_string(),
            provider: "openai".to_string(),
        }
    }
}

/// Orchestrates the LLM evaluation chain for one job at a time
pub struct Evaluator {
    jobs: Arc<dyn JobRepository>,
    uploads: Arc<dyn UploadRepository>,
    results: Arc<dyn ResultRepository>,
    ai: Arc<dyn AiClient>,
    vector: Option<Arc<dyn VectorClient>>,
    repairer: ResponseRepairer,
    tokens: Arc<TokenCounter>,
    metrics: Arc<PipelineMetrics>,
    config: EvaluatorConfig,
}

impl Evaluator {
    /// Wire the orchestrator. Every dependency is required up front;
    /// only the vector client is optional (RAG degrades gracefully).
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        uploads: Arc<dyn UploadRepository>,
        results: Arc<dyn ResultRepository>,
        ai: Arc<dyn AiClient>,
        vector: Option<Arc<dyn VectorClient>>,
        config: EvaluatorConfig,
    ) -> Self {
        let repairer = ResponseRepairer::with_cot(ai.clone());
        Self {
            jobs,
            uploads,
            results,
            ai,
            vector,
            repairer,
            tokens: Arc::new(TokenCounter::new()),
            metrics: Arc::new(PipelineMetrics::new()),
            config,
        }
    }

    /// Share a metrics handle with the rest of the pipeline
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn evaluate_inner(&self, payload: &EvaluateTaskPayload) -> Result<()> {
        let started = Instant::now();
        self.jobs
            .update_status(&payload.job_id, JobStatus::Processing, None)
            .await?;

        let cv = match self.uploads.get(&payload.cv_id).await {
            Ok(upload) => upload,
            Err(e) => {
                warn!(cv_id = %payload.cv_id, error = %e, "CV upload lookup failed");
                self.mark_failed(&payload.job_id, "failed to get CV content")
                    .await;
                return Err(PipelineError::NotFound(format!(
                    "cv upload {} not found",
                    payload.cv_id
                )));
            }
        };
        let project = match self.uploads.get(&payload.project_id).await {
            Ok(upload) => upload,
            Err(e) => {
                warn!(project_id = %payload.project_id, error = %e, "project upload lookup failed");
                self.mark_failed(&payload.job_id, "failed to get project content")
                    .await;
                return Err(PipelineError::NotFound(format!(
                    "project upload {} not found",
                    payload.project_id
                )));
            }
        };

        let rag = rag::fetch_rag_context(
            self.vector.as_ref(),
            &self.ai,
            payload,
            &cv.text,
            &project.text,
        )
        .await;

        let mut scores = None;
        let mut last_error = None;
        for attempt in 1..=self.config.max_chain_attempts {
            match self.run_chain(payload, &cv.text, &project.text, &rag).await {
                Ok(result) => {
                    scores = Some(result);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "evaluation chain attempt failed");
                    last_error = Some(e);
                    if attempt < self.config.max_chain_attempts {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                    }
                }
            }
        }

        let scores = match scores {
            Some(scores) => scores,
            None => {
                info!(
                    job_id = %payload.job_id,
                    "chain exhausted, falling back to fast path"
                );
                match self.run_fast_path(payload, &cv.text, &project.text).await {
                    Ok(scores) => scores,
                    Err(fast_err) => {
                        let chain_err = last_error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        error!(
                            job_id = %payload.job_id,
                            chain_error = %chain_err,
                            fast_path_error = %fast_err,
                            "evaluation failed after chain and fast path"
                        );
                        self.mark_failed(
                            &payload.job_id,
                            &format!("evaluation failed: {fast_err}"),
                        )
                        .await;
                        return Err(fast_err);
                    }
                }
            }
        };

        let result = finalize(&payload.job_id, scores);

        // Result first, status second: a `completed` job must always have
        // a result row behind it.
        self.results.upsert(&result).await?;
        self.jobs
            .update_status(&payload.job_id, JobStatus::Completed, None)
            .await?;

        self.metrics
            .record_scores(result.cv_match_rate, result.project_score);
        self.metrics.record_processing_duration(started.elapsed());
        info!(
            job_id = %payload.job_id,
            cv_match_rate = result.cv_match_rate,
            project_score = result.project_score,
            "evaluation completed"
        );
        Ok(())
    }

    /// Steps A through D of the multi-step chain
    async fn run_chain(
        &self,
        payload: &EvaluateTaskPayload,
        cv_text: &str,
        project_text: &str,
        rag: &RagContext,
    ) -> Result<CanonicalScores> {
        // Step A: CV match narrative
        let cv_system = prompts::cv_match_system(payload, cv_text, rag);
        let cv_user = prompts::cv_match_user();
        let cv_analysis = self
            .ai
            .chat_json(&cv_system, &cv_user, self.config.step_max_tokens)
            .await?;
        self.account_tokens(&cv_system, &cv_user, &cv_analysis);
        debug!(job_id = %payload.job_id, "cv analysis complete");

        // Step B: project evaluation narrative
        let project_system = prompts::project_eval_system(payload, project_text, rag);
        let project_user = prompts::project_eval_user();
        let project_analysis = self
            .ai
            .chat_json(&project_system, &project_user, self.config.step_max_tokens)
            .await?;
        self.account_tokens(&project_system, &project_user, &project_analysis);
        debug!(job_id = %payload.job_id, "project analysis complete");

        // Step C: refine both analyses into the canonical object
        let refine_system = prompts::refine_system();
        let refine_user = prompts::refine_user(&cv_analysis, &project_analysis);
        let refined = self
            .ai
            .chat_json_with_retry(&refine_system, &refine_user, self.config.step_max_tokens)
            .await?;
        self.account_tokens(&refine_system, &refine_user, &refined);

        // Step D: repair, parse, validate
        self.parse_scores(&refined).await
    }

    /// One-shot fallback prompt carrying every input
    async fn run_fast_path(
        &self,
        payload: &EvaluateTaskPayload,
        cv_text: &str,
        project_text: &str,
    ) -> Result<CanonicalScores> {
        let system = prompts::fast_path_system();
        let user = prompts::fast_path_user(payload, cv_text, project_text);
        let response = self
            .ai
            .chat_json_with_retry(&system, &user, self.config.step_max_tokens)
            .await?;
        self.account_tokens(&system, &user, &response);
        self.parse_scores(&response).await
    }

    async fn parse_scores(&self, raw: &str) -> Result<CanonicalScores> {
        let cleaned = self.repairer.clean_and_validate(raw).await?;
        let scores: CanonicalScores = serde_json::from_str(&cleaned)?;
        Ok(scores)
    }

    fn account_tokens(&self, system: &str, user: &str, completion: &str) {
        let usage = self.tokens.calculate_usage(
            system,
            user,
            completion,
            &self.config.model,
            &self.config.provider,
        );
        self.metrics.record_tokens(usage.total_tokens);
    }

    async fn mark_failed(&self, job_id: &str, message: &str) {
        if let Err(e) = self
            .jobs
            .update_status(job_id, JobStatus::Failed, Some(message))
            .await
        {
            error!(job_id, error = %e, "failed to mark job as failed");
        }
    }
}

#[async_trait]
impl EvaluateHandler for Evaluator {
    async fn handle_evaluate(&self, payload: &EvaluateTaskPayload) -> Result<()> {
        match tokio::time::timeout(self.config.processing_budget, self.evaluate_inner(payload))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                self.mark_failed(&payload.job_id, "job processing timeout")
                    .await;
                Err(PipelineError::UpstreamTimeout(format!(
                    "job {} exceeded the processing budget",
                    payload.job_id
                )))
            }
        }
    }
}

/// Clamp scores into their documented ranges and substitute placeholders
/// for empty feedback
fn finalize(job_id: &str, scores: CanonicalScores) -> EvalResult {
    EvalResult {
        job_id: job_id.to_string(),
        cv_match_rate: scores.cv_match_rate.clamp(0.0, 1.0),
        project_score: scores.project_score.clamp(1.0, 10.0),
        cv_feedback: non_empty(scores.cv_feedback, EMPTY_CV_FEEDBACK),
        project_feedback: non_empty(scores.project_feedback, EMPTY_PROJECT_FEEDBACK),
        overall_summary: non_empty(scores.overall_summary, EMPTY_SUMMARY),
        created_at: Utc::now(),
    }
}

fn non_empty(value: String, placeholder: &str) -> String {
    if value.trim().is_empty() {
        placeholder.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_clamps_out_of_range_scores() {
        let result = finalize(
            "J1",
            CanonicalScores {
                cv_match_rate: 1.7,
                cv_feedback: "good".to_string(),
                project_score: 0.0,
                project_feedback: "solid".to_string(),
                overall_summary: "ok".to_string(),
            },
        );
        assert_eq!(result.cv_match_rate, 1.0);
        assert_eq!(result.project_score, 1.0);
    }

    #[test]
    fn test_finalize_substitutes_placeholders() {
        let result = finalize(
            "J1",
            CanonicalScores {
                cv_match_rate: 0.5,
                cv_feedback: "  ".to_string(),
                project_score: 5.0,
                project_feedback: String::new(),
                overall_summary: "fine".to_string(),
            },
        );
        assert_eq!(result.cv_feedback, EMPTY_CV_FEEDBACK);
        assert_eq!(result.project_feedback, EMPTY_PROJECT_FEEDBACK);
        assert_eq!(result.overall_summary, "fine");
    }

    #[test]
    fn test_finalize_keeps_in_range_scores() {
        let result = finalize(
            "J1",
            CanonicalScores {
                cv_match_rate: 0.8,
                cv_feedback: "good".to_string(),
                project_score: 8.5,
                project_feedback: "solid".to_string(),
                overall_summary: "ok".to_string(),
            },
        );
        assert_eq!(result.cv_match_rate, 0.8);
        assert_eq!(result.project_score, 8.5);
    }
}
