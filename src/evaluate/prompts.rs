//! Prompt composition for the evaluation chain

use crate::domain::EvaluateTaskPayload;

use super::rag::RagContext;

/// The JSON shape every chain ends in
pub const CANONICAL_SHAPE: &str = r#"{"cv_match_rate": <number 0.0-1.0>, "cv_feedback": "<string>", "project_score": <number 1.0-10.0>, "project_feedback": "<string>", "overall_summary": "<string>"}"#;

/// System prompt for the CV-match analysis step
pub fn cv_match_system(payload: &EvaluateTaskPayload, cv_text: &str, rag: &RagContext) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are a senior technical recruiter. Analyze how well the candidate's CV \
         matches the job description. Cover skill overlap, experience depth, and gaps. \
         Respond with a focused narrative analysis, no JSON.\n\n",
    );
    prompt.push_str("## Job description\n");
    prompt.push_str(&payload.job_description);
    prompt.push_str("\n\n## Candidate CV\n");
    prompt.push_str(cv_text);
    if let Some(context) = &rag.job_context {
        prompt.push_str("\n\n## Related role context\n");
        prompt.push_str(context);
    }
    prompt.push_str("\n\n## Scoring rubric\n");
    prompt.push_str(&payload.scoring_rubric);
    prompt
}

/// User prompt for the CV-match analysis step
pub fn cv_match_user() -> String {
    "Analyze the CV against the job description and rubric above.".to_string()
}

/// System prompt for the project evaluation step
pub fn project_eval_system(
    payload: &EvaluateTaskPayload,
    project_text: &str,
    rag: &RagContext,
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are a principal engineer reviewing a take-home project. Score it against \
         the weighted rubric:\n\
         - Correctness and requirements coverage: 30%\n\
         - Code quality and structure: 25%\n\
         - Resilience and error handling: 20%\n\
         - Documentation and clarity: 15%\n\
         - Creativity beyond requirements: 10%\n\
         Respond with a focused narrative review, no JSON.\n\n",
    );
    prompt.push_str("## Study case brief\n");
    prompt.push_str(&payload.study_case_brief);
    prompt.push_str("\n\n## Project report\n");
    prompt.push_str(project_text);
    if let Some(context) = &rag.rubric_context {
        prompt.push_str("\n\n## Scoring guidance\n");
        prompt.push_str(context);
    }
    prompt.push_str("\n\n## Scoring rubric\n");
    prompt.push_str(&payload.scoring_rubric);
    prompt
}

/// User prompt for the project evaluation step
pub fn project_eval_user() -> String {
    "Review the project against the brief and rubric above.".to_string()
}

/// System prompt for the refinement step, which folds both analyses into
/// the canonical JSON object
pub fn refine_system() -> String {
    format!(
        "You combine evaluation analyses into a single JSON result. Output exactly one \
         JSON object of this shape and nothing else:\n{CANONICAL_SHAPE}"
    )
}

/// User prompt for the refinement step
pub fn refine_user(cv_analysis: &str, project_analysis: &str) -> String {
    format!(
        "## CV match analysis\n{cv_analysis}\n\n## Project evaluation\n{project_analysis}\n\n\
         Produce the canonical JSON object."
    )
}

/// Single prompt used by the fast-path fallback when the multi-step chain
/// keeps failing
pub fn fast_path_system() -> String {
    format!(
        "You are an evaluation service. Read the inputs and output exactly one JSON \
         object of this shape and nothing else:\n{CANONICAL_SHAPE}"
    )
}

/// User prompt for the fast-path fallback, carrying every input at once
pub fn fast_path_user(payload: &EvaluateTaskPayload, cv_text: &str, project_text: &str) -> String {
    format!(
        "## Job description\n{}\n\n## Candidate CV\n{}\n\n## Study case brief\n{}\n\n\
         ## Project report\n{}\n\n## Scoring rubric\n{}",
        payload.job_description, cv_text, payload.study_case_brief, project_text, payload.scoring_rubric
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> EvaluateTaskPayload {
        EvaluateTaskPayload {
            job_id: "J1".to_string(),
            cv_id: "C1".to_string(),
            project_id: "P1".to_string(),
            job_description: "Rust backend engineer".to_string(),
            study_case_brief: "Build a queue".to_string(),
            scoring_rubric: "Weight correctness highest".to_string(),
            request_id: None,
        }
    }

    #[test]
    fn test_cv_prompt_includes_inputs_and_optional_rag() {
        let rag = RagContext::default();
        let prompt = cv_match_system(&payload(), "cv text here", &rag);
        assert!(prompt.contains("Rust backend engineer"));
        assert!(prompt.contains("cv text here"));
        assert!(prompt.contains("Weight correctness highest"));
        assert!(!prompt.contains("Related role context"));

        let rag = RagContext {
            job_context: Some("similar role".to_string()),
            rubric_context: None,
        };
        let prompt = cv_match_system(&payload(), "cv text here", &rag);
        assert!(prompt.contains("similar role"));
    }

    #[test]
    fn test_project_prompt_carries_rubric_weights() {
        let prompt = project_eval_system(&payload(), "project text", &RagContext::default());
        assert!(prompt.contains("30%"));
        assert!(prompt.contains("25%"));
        assert!(prompt.contains("20%"));
        assert!(prompt.contains("15%"));
        assert!(prompt.contains("10%"));
    }

    #[test]
    fn test_json_prompts_pin_canonical_shape() {
        assert!(refine_system().contains("cv_match_rate"));
        assert!(fast_path_system().contains("project_score"));
    }
}
