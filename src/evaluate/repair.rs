//! LLM response repair
//!
//! Models rarely return the canonical result object cleanly: it arrives
//! fenced, prefixed with prose, quoted with smart quotes, or shaped like
//! a different schema entirely. The repairer runs a staged pipeline —
//! textual cleanup, syntax repair, object extraction, strict parse, then
//! shape transformation — and falls back to one chain-of-thought
//! cleaning call when all of that fails. Stage order matters: later
//! stages assume earlier artifacts are gone.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clients::AiClient;
use crate::error::{PipelineError, Result};

/// Preamble lines models like to put in front of the object
const PREAMBLE_PREFIXES: &[&str] = &[
    "here's the evaluation result:",
    "here is the evaluation result:",
    "result:",
    "json:",
    "response:",
];

static UNQUOTED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r#",\s*([}\]])"#).unwrap());
static SINGLE_QUOTED_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#"'([^'\n]*)'\s*:"#).unwrap());
static SINGLE_QUOTED_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r#":\s*'([^'\n]*)'"#).unwrap());
static BACKTICK_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]*)`").unwrap());
static BOLD_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").unwrap());
static ITALIC_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());

/// The canonical result object every evaluation ends in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalScores {
    /// CV-to-job match rate, nominally in `[0, 1]` (clamped downstream)
    pub cv_match_rate: f64,
    /// Narrative feedback on the CV match
    #[serde(default)]
    pub cv_feedback: String,
    /// Project score, nominally in `[1, 10]` (clamped downstream)
    pub project_score: f64,
    /// Narrative feedback on the project
    #[serde(default)]
    pub project_feedback: String,
    /// One-paragraph overall summary
    #[serde(default)]
    pub overall_summary: String,
}

/// Normalizes LLM output into valid canonical JSON
#[derive(Clone, Default)]
pub struct ResponseRepairer {
    ai: Option<Arc<dyn AiClient>>,
}

impl ResponseRepairer {
    /// Repairer without the chain-of-thought fallback
    pub fn new() -> Self {
        Self { ai: None }
    }

    /// Repairer that may spend one `clean_cot_response` call when the
    /// textual pipeline fails
    pub fn with_cot(ai: Arc<dyn AiClient>) -> Self {
        Self { ai: Some(ai) }
    }

    /// Repair `text` into canonical JSON.
    ///
    /// Valid canonical input comes back unchanged (modulo surrounding
    /// noise); everything else is repaired, shape-transformed, or — as a
    /// last resort — cleaned once through the chain-of-thought fallback.
    pub async fn clean(&self, text: &str) -> Result<String> {
        if let Some(json) = repair_text(text) {
            return Ok(json);
        }

        if let Some(ai) = &self.ai {
            debug!("textual repair failed, trying chain-of-thought cleaning");
            let cleaned = ai
                .clean_cot_response(text)
                .await
                .map_err(|e| PipelineError::AiClient(format!("CoT cleaning failed: {e}")))?;
            if let Some(json) = repair_text(&cleaned) {
                return Ok(json);
            }
            warn!("chain-of-thought cleaning did not yield canonical JSON");
        }

        Err(PipelineError::SchemaInvalid(
            "unable to recover canonical JSON from model output".to_string(),
        ))
    }

    /// Whether `text` repairs into canonical JSON without the fallback
    pub fn is_valid(&self, text: &str) -> bool {
        repair_text(text).is_some()
    }

    /// Repair and re-verify; the returned text always parses into
    /// [`CanonicalScores`]
    pub async fn clean_and_validate(&self, text: &str) -> Result<String> {
        let cleaned = self.clean(text).await?;
        serde_json::from_str::<CanonicalScores>(&cleaned)
            .map_err(|e| PipelineError::SchemaInvalid(format!("repaired output invalid: {e}")))?;
        Ok(cleaned)
    }
}

/// The synchronous repair pipeline. Returns canonical JSON text, or
/// `None` when the input cannot be salvaged without the CoT fallback.
fn repair_text(text: &str) -> Option<String> {
    let stripped = strip_preamble(strip_fences(text.trim()));
    let normalized = normalize_artifacts(&stripped);
    let repaired = repair_syntax(&normalized);
    let object = extract_object(&repaired)?;

    // Already canonical: hand the extracted text back untouched so a
    // well-behaved model response round-trips byte for byte.
    if serde_json::from_str::<CanonicalScores>(&object).is_ok() {
        return Some(object);
    }

    let value: Value = serde_json::from_str(&object).ok()?;
    let scores = transform_shape(&value)?;
    serde_json::to_string(&scores).ok()
}

/// Drop Markdown code-fence markers, keeping the fenced content
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = trimmed
        .trim_start_matches("```")
        .trim_start_matches("json")
        .trim_start_matches("JSON");
    let without_close = without_open
        .trim_end()
        .trim_end_matches("```")
        .trim_end();
    without_close.trim().to_string()
}

/// Drop known prose prefixes the models put before the object
fn strip_preamble(text: String) -> String {
    let mut current = text.trim().to_string();
    loop {
        let lower = current.to_lowercase();
        let Some(prefix) = PREAMBLE_PREFIXES.iter().find(|p| lower.starts_with(**p)) else {
            return current;
        };
        current = current[prefix.len()..].trim_start().to_string();
    }
}

/// Replace smart quotes, backticks, single-quoted keys/values, and
/// Markdown emphasis with plain JSON punctuation
fn normalize_artifacts(text: &str) -> String {
    let mut out = text
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    out = SINGLE_QUOTED_KEY.replace_all(&out, "\"$1\":").into_owned();
    out = SINGLE_QUOTED_VALUE.replace_all(&out, ": \"$1\"").into_owned();
    out = BACKTICK_QUOTED.replace_all(&out, "\"$1\"").into_owned();
    out = BOLD_MARKER.replace_all(&out, "$1").into_owned();
    out = ITALIC_MARKER.replace_all(&out, "$1").into_owned();
    out
}

/// Quote unquoted identifiers used as keys and drop trailing commas
fn repair_syntax(text: &str) -> String {
    let keyed = UNQUOTED_KEY.replace_all(text, "$1\"$2\":").into_owned();
    TRAILING_COMMA.replace_all(&keyed, "$1").into_owned()
}

/// Slice out the outermost `{ … }` object
fn extract_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

/// Map an ad-hoc result shape onto the canonical one.
///
/// Returns `None` when neither score can be obtained — the caller must
/// retry with a different model rather than invent numbers.
fn transform_shape(value: &Value) -> Option<CanonicalScores> {
    let obj = value.as_object()?;

    let cv_match_rate = extract_match_rate(value, obj)?;
    let project_score = extract_project_score(value, obj)?;

    Some(CanonicalScores {
        cv_match_rate,
        cv_feedback: extract_string(obj, &["cv_feedback", "cv_analysis", "match_feedback"]),
        project_score,
        project_feedback: extract_string(obj, &["project_feedback", "project_analysis", "review"]),
        overall_summary: extract_string(obj, &["overall_summary", "summary", "overall", "conclusion"]),
    })
}

fn extract_match_rate(value: &Value, obj: &serde_json::Map<String, Value>) -> Option<f64> {
    for key in ["cv_match_rate", "cv_match", "match_rate", "cv_score"] {
        if let Some(rate) = obj.get(key).and_then(as_f64_lenient) {
            return Some(normalize_rate(rate));
        }
    }
    if let Some(score) = value
        .pointer("/technical_skills_match/score")
        .and_then(as_f64_lenient)
    {
        return Some(normalize_rate(score));
    }
    // Derivations from structure the model volunteered instead of a rate
    if let Some(matched) = obj.get("matched_skills").and_then(Value::as_array) {
        let total = obj
            .get("total_skills")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .max(1) as f64;
        return Some((matched.len() as f64 / total).clamp(0.0, 1.0));
    }
    if let Some(years) = obj.get("experience_years").and_then(as_f64_lenient) {
        return Some((years / 10.0).clamp(0.0, 1.0));
    }
    if let Some(label) = obj.get("complexity").and_then(Value::as_str) {
        return complexity_to_rate(label);
    }
    None
}

fn extract_project_score(value: &Value, obj: &serde_json::Map<String, Value>) -> Option<f64> {
    for key in ["project_score", "score", "project_rating"] {
        if let Some(score) = obj.get(key).and_then(as_f64_lenient) {
            return Some(score);
        }
    }
    if let Some(score) = value
        .pointer("/project_evaluation/score")
        .and_then(as_f64_lenient)
    {
        return Some(score);
    }
    if let Some(technologies) = obj.get("technologies").and_then(Value::as_array) {
        return Some((technologies.len() as f64 * 1.5).clamp(1.0, 10.0));
    }
    if let Some(label) = obj
        .get("project_complexity")
        .or_else(|| obj.get("complexity"))
        .and_then(Value::as_str)
    {
        return complexity_to_score(label);
    }
    None
}

fn extract_string(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = obj.get(*key).and_then(Value::as_str) {
            if !s.trim().is_empty() {
                return s.to_string();
            }
        }
    }
    String::new()
}

/// Numbers, numeric strings, and percent strings all count
fn as_f64_lenient(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(pct) = trimmed.strip_suffix('%') {
                return pct.trim().parse::<f64>().ok().map(|v| v / 100.0);
            }
            trimmed.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Squeeze 10-point and percentage scales into `[0, 1]`
fn normalize_rate(rate: f64) -> f64 {
    if rate > 10.0 {
        rate / 100.0
    } else if rate > 1.0 {
        rate / 10.0
    } else {
        rate
    }
}

fn complexity_to_rate(label: &str) -> Option<f64> {
    match label.trim().to_lowercase().as_str() {
        "low" | "simple" => Some(0.4),
        "medium" | "moderate" => Some(0.65),
        "high" | "complex" => Some(0.85),
        _ => None,
    }
}

fn complexity_to_score(label: &str) -> Option<f64> {
    match label.trim().to_lowercase().as_str() {
        "low" | "simple" => Some(4.0),
        "medium" | "moderate" => Some(6.5),
        "high" | "complex" => Some(8.5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CANONICAL: &str = r#"{"cv_match_rate":0.8,"cv_feedback":"good","project_score":8.5,"project_feedback":"solid","overall_summary":"ok"}"#;

    #[test]
    fn test_canonical_input_round_trips_unchanged() {
        assert_eq!(repair_text(CANONICAL).unwrap(), CANONICAL);
    }

    #[test]
    fn test_strips_fences_and_preamble() {
        let fenced = format!("```json\n{CANONICAL}\n```");
        assert_eq!(repair_text(&fenced).unwrap(), CANONICAL);

        let prefixed = format!("Here's the evaluation result:\n{CANONICAL}");
        assert_eq!(repair_text(&prefixed).unwrap(), CANONICAL);

        let both = format!("Response: ```\n{CANONICAL}\n```");
        assert_eq!(repair_text(&both).unwrap(), CANONICAL);
    }

    #[test]
    fn test_repairs_unquoted_keys_and_trailing_commas() {
        let broken = r#"{cv_match_rate: 0.8, cv_feedback: "good", project_score: 8.5, project_feedback: "solid", overall_summary: "ok",}"#;
        let repaired = repair_text(broken).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.8);
        assert_eq!(scores.project_score, 8.5);
    }

    #[test]
    fn test_normalizes_quote_artifacts() {
        let smart = "{\u{201c}cv_match_rate\u{201d}: 0.7, 'cv_feedback': 'fine', `project_score`: 7, 'project_feedback': 'ok', 'overall_summary': 'ok'}";
        let repaired = repair_text(smart).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.7);
        assert_eq!(scores.cv_feedback, "fine");
    }

    #[test]
    fn test_extracts_object_from_surrounding_prose() {
        let noisy = format!("The final verdict follows.\n{CANONICAL}\nLet me know if you need more.");
        assert_eq!(repair_text(&noisy).unwrap(), CANONICAL);
    }

    #[test]
    fn test_transforms_alternate_field_names() {
        let alt = r#"{"cv_match": "80%", "match_feedback": "strong", "score": "8.5", "summary": "good fit"}"#;
        let repaired = repair_text(alt).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.8);
        assert_eq!(scores.project_score, 8.5);
        assert_eq!(scores.overall_summary, "good fit");
    }

    #[test]
    fn test_transforms_nested_skill_score() {
        let nested = r#"{"technical_skills_match": {"score": 7}, "project_score": 6}"#;
        let repaired = repair_text(nested).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.7);
    }

    #[test]
    fn test_derives_from_skill_and_technology_counts() {
        let derived = r#"{"matched_skills": ["rust", "kafka", "sql"], "total_skills": 5, "technologies": ["rust", "redpanda", "postgres", "docker"]}"#;
        let repaired = repair_text(derived).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.6);
        assert_eq!(scores.project_score, 6.0);
    }

    #[test]
    fn test_derives_from_complexity_labels() {
        let labeled = r#"{"complexity": "high", "project_complexity": "medium"}"#;
        let repaired = repair_text(labeled).unwrap();
        let scores: CanonicalScores = serde_json::from_str(&repaired).unwrap();
        assert_eq!(scores.cv_match_rate, 0.85);
        assert_eq!(scores.project_score, 6.5);
    }

    #[test]
    fn test_unsalvageable_input_returns_none() {
        assert!(repair_text("The candidate seems fine overall.").is_none());
        assert!(repair_text("").is_none());
        assert!(repair_text(r#"{"irrelevant": true}"#).is_none());
    }

    #[test]
    fn test_is_valid_matches_repair() {
        let repairer = ResponseRepairer::new();
        assert!(repairer.is_valid(CANONICAL));
        assert!(repairer.is_valid(&format!("```json\n{CANONICAL}\n```")));
        assert!(!repairer.is_valid("no json here"));
    }

    #[tokio::test]
    async fn test_clean_without_cot_errors_on_garbage() {
        let repairer = ResponseRepairer::new();
        let err = repairer.clean("pure narrative").await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaInvalid(_)));
    }

    #[test]
    fn test_lenient_number_parsing() {
        assert_eq!(as_f64_lenient(&serde_json::json!(0.8)), Some(0.8));
        assert_eq!(as_f64_lenient(&serde_json::json!("0.8")), Some(0.8));
        assert_eq!(as_f64_lenient(&serde_json::json!("80%")), Some(0.8));
        assert_eq!(as_f64_lenient(&serde_json::json!(null)), None);
    }
}
