//! End-to-end tests of the evaluation orchestrator against stubbed
//! collaborators

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{payload, StubAi, StubJobs, StubResults, StubUploads, StubVector};
use eval_pipeline::clients::VectorClient;
use eval_pipeline::domain::JobStatus;
use eval_pipeline::evaluate::{Evaluator, EvaluatorConfig};
use eval_pipeline::queue::EvaluateHandler;

const CANONICAL: &str = r#"{"cv_match_rate":0.8,"cv_feedback":"good","project_score":8.5,"project_feedback":"solid","overall_summary":"ok"}"#;

struct Fixture {
    jobs: Arc<StubJobs>,
    uploads: Arc<StubUploads>,
    results: Arc<StubResults>,
    ai: Arc<StubAi>,
    evaluator: Evaluator,
}

fn fixture(ai: StubAi, vector: Option<Arc<dyn VectorClient>>) -> Fixture {
    let jobs = Arc::new(StubJobs::default());
    let uploads = Arc::new(StubUploads::default());
    let results = Arc::new(StubResults::default());
    let ai = Arc::new(ai);
    let evaluator = Evaluator::new(
        jobs.clone(),
        uploads.clone(),
        results.clone(),
        ai.clone(),
        vector,
        EvaluatorConfig::default(),
    );
    Fixture {
        jobs,
        uploads,
        results,
        ai,
        evaluator,
    }
}

#[tokio::test(start_paused = true)]
async fn happy_path_persists_result_and_completes_job() {
    let ai = StubAi::default().script(vec![
        Ok("The CV aligns well with the role.".to_string()),
        Ok("The project covers the brief.".to_string()),
        Ok(CANONICAL.to_string()),
    ]);
    let fx = fixture(ai, None);
    let task = payload("J1");
    fx.jobs.seed_queued("J1");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap();

    assert_eq!(fx.results.upsert_count(), 1);
    let result = fx.results.last().unwrap();
    assert_eq!(result.job_id, "J1");
    assert_eq!(result.cv_match_rate, 0.8);
    assert_eq!(result.project_score, 8.5);
    assert_eq!(result.cv_feedback, "good");

    assert_eq!(
        fx.jobs.transitions_of("J1"),
        vec![JobStatus::Processing, JobStatus::Completed]
    );
    assert_eq!(fx.jobs.status_of("J1"), Some(JobStatus::Completed));
    // no chain-of-thought cleaning needed on the happy path
    assert_eq!(fx.ai.cot_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_scores_are_clamped() {
    let ai = StubAi::default().script(vec![
        Ok("cv analysis".to_string()),
        Ok("project analysis".to_string()),
        Ok(r#"{"cv_match_rate":1.7,"cv_feedback":"good","project_score":0,"project_feedback":"solid","overall_summary":"ok"}"#.to_string()),
    ]);
    let fx = fixture(ai, None);
    let task = payload("J2");
    fx.jobs.seed_queued("J2");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap();

    let result = fx.results.last().unwrap();
    assert_eq!(result.cv_match_rate, 1.0);
    assert_eq!(result.project_score, 1.0);
    assert_eq!(fx.jobs.status_of("J2"), Some(JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn missing_cv_upload_fails_without_result_or_ai_calls() {
    let fx = fixture(StubAi::default(), None);
    let task = payload("J3");
    fx.jobs.seed_queued("J3");
    // only the project upload exists
    fx.uploads.insert(
        &task.project_id,
        eval_pipeline::domain::UploadKind::Project,
        "project text",
    );

    let err = fx.evaluator.handle_evaluate(&task).await.unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");

    assert_eq!(fx.results.upsert_count(), 0);
    assert_eq!(fx.jobs.status_of("J3"), Some(JobStatus::Failed));
    assert_eq!(
        fx.jobs.error_of("J3").unwrap(),
        "failed to get CV content"
    );
    assert_eq!(fx.ai.chat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn narrative_refinement_recovers_through_cot_cleaning() {
    let ai = StubAi::default()
        .script(vec![
            Ok("cv analysis".to_string()),
            Ok("project analysis".to_string()),
            Ok("After thinking it over, the candidate is strong and the project is solid."
                .to_string()),
        ])
        .cot(CANONICAL);
    let fx = fixture(ai, None);
    let task = payload("J4");
    fx.jobs.seed_queued("J4");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap();

    assert_eq!(fx.ai.cot_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.results.upsert_count(), 1);
    assert_eq!(fx.jobs.status_of("J4"), Some(JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn chain_exhaustion_falls_back_to_fast_path() {
    // Every chain attempt dies on its first step; the fast path succeeds.
    let ai = StubAi::default()
        .script(vec![
            Err(eval_pipeline::PipelineError::AiClient("boom 1".to_string())),
            Err(eval_pipeline::PipelineError::AiClient("boom 2".to_string())),
            Err(eval_pipeline::PipelineError::AiClient("boom 3".to_string())),
            Ok(CANONICAL.to_string()),
        ]);
    let fx = fixture(ai, None);
    let task = payload("J5");
    fx.jobs.seed_queued("J5");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap();

    assert_eq!(fx.results.upsert_count(), 1);
    assert_eq!(fx.jobs.status_of("J5"), Some(JobStatus::Completed));
    // three failed chain openings plus the fast-path call
    assert_eq!(fx.ai.chat_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn fast_path_failure_marks_job_failed() {
    let ai = StubAi::default().script(vec![
        Err(eval_pipeline::PipelineError::AiClient("boom 1".to_string())),
        Err(eval_pipeline::PipelineError::AiClient("boom 2".to_string())),
        Err(eval_pipeline::PipelineError::AiClient("boom 3".to_string())),
        Err(eval_pipeline::PipelineError::AiClient("boom 4".to_string())),
    ]);
    let fx = fixture(ai, None);
    let task = payload("J6");
    fx.jobs.seed_queued("J6");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap_err();

    assert_eq!(fx.results.upsert_count(), 0);
    assert_eq!(fx.jobs.status_of("J6"), Some(JobStatus::Failed));
    let error = fx.jobs.error_of("J6").unwrap();
    assert!(error.starts_with("evaluation failed"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn rag_searches_both_collections_when_vector_client_present() {
    let ai = StubAi::default().script(vec![
        Ok("cv analysis".to_string()),
        Ok("project analysis".to_string()),
        Ok(CANONICAL.to_string()),
    ]);
    let vector = Arc::new(StubVector::default());
    let fx = fixture(ai, Some(vector.clone() as Arc<dyn VectorClient>));
    let task = payload("J7");
    fx.jobs.seed_queued("J7");
    fx.uploads.seed_for(&task);

    fx.evaluator.handle_evaluate(&task).await.unwrap();

    let searches = vector.searches.lock().clone();
    assert_eq!(
        searches,
        vec![
            ("job_description".to_string(), 3),
            ("scoring_rubric".to_string(), 2)
        ]
    );
    assert_eq!(fx.jobs.status_of("J7"), Some(JobStatus::Completed));
}
