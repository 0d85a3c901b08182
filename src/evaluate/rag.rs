//! Best-effort retrieval-augmented context
//!
//! When a vector client is wired in, the evaluator enriches its prompts
//! with semantically similar snippets. This stage is strictly optional:
//! every failure is logged and swallowed, and evaluation proceeds with
//! whatever context was retrieved.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clients::{AiClient, VectorClient};
use crate::domain::EvaluateTaskPayload;

/// Collection holding indexed job descriptions
const JOB_DESCRIPTION_COLLECTION: &str = "job_description";
/// Collection holding indexed scoring rubrics
const SCORING_RUBRIC_COLLECTION: &str = "scoring_rubric";
/// Hits pulled from the job-description collection
const JOB_TOP_K: usize = 3;
/// Hits pulled from the rubric collection
const RUBRIC_TOP_K: usize = 2;

/// Retrieved context snippets, either of which may be absent
#[derive(Debug, Clone, Default)]
pub struct RagContext {
    /// Snippets related to the job description
    pub job_context: Option<String>,
    /// Snippets related to the scoring rubric
    pub rubric_context: Option<String>,
}

/// Retrieve context for one evaluation. Never fails: a missing vector
/// client, a failed embedding, or a failed search all degrade to an
/// empty context.
pub async fn fetch_rag_context(
    vector: Option<&Arc<dyn VectorClient>>,
    ai: &Arc<dyn AiClient>,
    payload: &EvaluateTaskPayload,
    cv_text: &str,
    project_text: &str,
) -> RagContext {
    let Some(vector) = vector else {
        return RagContext::default();
    };

    let query = format!(
        "{}\n{}\n{}\n{}",
        cv_text, project_text, payload.job_description, payload.study_case_brief
    );

    let embedding = match ai.embed(&[query]).await {
        Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
        Ok(_) => {
            warn!(job_id = %payload.job_id, "embedding call returned no vectors");
            return RagContext::default();
        }
        Err(e) => {
            warn!(job_id = %payload.job_id, error = %e, "embedding failed, skipping RAG");
            return RagContext::default();
        }
    };

    let job_context = search_collection(
        vector,
        JOB_DESCRIPTION_COLLECTION,
        &embedding,
        JOB_TOP_K,
        &payload.job_id,
    )
    .await;
    let rubric_context = search_collection(
        vector,
        SCORING_RUBRIC_COLLECTION,
        &embedding,
        RUBRIC_TOP_K,
        &payload.job_id,
    )
    .await;

    debug!(
        job_id = %payload.job_id,
        has_job_context = job_context.is_some(),
        has_rubric_context = rubric_context.is_some(),
        "RAG context assembled"
    );
    RagContext {
        job_context,
        rubric_context,
    }
}

async fn search_collection(
    vector: &Arc<dyn VectorClient>,
    collection: &str,
    embedding: &[f32],
    top_k: usize,
    job_id: &str,
) -> Option<String> {
    match vector.search(collection, embedding, top_k).await {
        Ok(hits) if !hits.is_empty() => {
            let joined = hits
                .iter()
                .map(|hit| hit.payload.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            Some(joined)
        }
        Ok(_) => None,
        Err(e) => {
            warn!(job_id, collection, error = %e, "vector search failed, skipping");
            None
        }
    }
}
