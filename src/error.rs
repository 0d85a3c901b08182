//! Error types and the stable failure-code taxonomy
//!
//! Every failure surfaced by the pipeline carries a [`PipelineError`], and
//! every error text can be mapped onto a fixed [`ErrorCode`] set via
//! [`classify_failure_code`]. Retry routing and DLQ cooldown decisions key
//! off these codes, never off provider-specific error strings.

use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Top-level error type for the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller-supplied data violates a contract
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced upload or job is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// A payload or LLM response failed validation
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// The AI or vector provider signaled throttling
    #[error("upstream rate limit: {0}")]
    UpstreamRateLimit(String),

    /// The AI or vector provider exceeded its deadline
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Broker-level failure
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Repository call failed
    #[error("repository error: {0}")]
    Repository(String),

    /// AI client call failed
    #[error("ai client error: {0}")]
    AiClient(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Graceful shutdown did not complete in time
    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// Everything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            PipelineError::NotFound(_) => ErrorCode::NotFound,
            PipelineError::SchemaInvalid(_) => ErrorCode::SchemaInvalid,
            PipelineError::UpstreamRateLimit(_) => ErrorCode::UpstreamRateLimit,
            PipelineError::UpstreamTimeout(_) => ErrorCode::UpstreamTimeout,
            // Broker and collaborator failures carry free-form text; fall
            // back to substring classification so wrapped provider errors
            // (e.g. "429 rate limit exceeded") still route correctly.
            PipelineError::Kafka(e) => classify_failure_code(&e.to_string()),
            PipelineError::Repository(msg)
            | PipelineError::AiClient(msg)
            | PipelineError::Internal(msg) => classify_failure_code(msg),
            PipelineError::Serialization(_) => ErrorCode::SchemaInvalid,
            PipelineError::Config(_) => ErrorCode::InvalidArgument,
            PipelineError::Shutdown(_) => ErrorCode::Internal,
        }
    }
}

/// Stable failure codes, independent of the provider wording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// Payload or LLM response failed validation
    #[serde(rename = "SCHEMA_INVALID")]
    SchemaInvalid,
    /// Provider signaled throttling
    #[serde(rename = "UPSTREAM_RATE_LIMIT")]
    UpstreamRateLimit,
    /// Provider exceeded its deadline
    #[serde(rename = "UPSTREAM_TIMEOUT")]
    UpstreamTimeout,
    /// Referenced entity missing
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    /// Caller-supplied data violates a contract
    #[serde(rename = "INVALID_ARGUMENT")]
    InvalidArgument,
    /// All other failures
    #[serde(rename = "INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SchemaInvalid => "SCHEMA_INVALID",
            ErrorCode::UpstreamRateLimit => "UPSTREAM_RATE_LIMIT",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether the retry manager should route this failure straight to
    /// the DLQ instead of retrying inline
    pub fn is_upstream_pressure(&self) -> bool {
        matches!(
            self,
            ErrorCode::UpstreamRateLimit | ErrorCode::UpstreamTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map free-form error text onto a stable code.
///
/// Total and idempotent: defined for every string, and classifying the
/// code's own wire name yields the same code back.
pub fn classify_failure_code(message: &str) -> ErrorCode {
    let msg = message.trim().to_lowercase();
    if msg.is_empty() {
        return ErrorCode::Internal;
    }
    if msg.contains("schema invalid")
        || msg.contains("schema_invalid")
        || msg.contains("invalid json")
        || msg.contains("out of range")
        || msg.contains("empty")
    {
        return ErrorCode::SchemaInvalid;
    }
    if msg.contains("rate limit") || msg.contains("rate_limit") {
        return ErrorCode::UpstreamRateLimit;
    }
    if msg.contains("timeout") || msg.contains("deadline exceeded") {
        return ErrorCode::UpstreamTimeout;
    }
    if msg.contains("not found") || msg.contains("not_found") {
        return ErrorCode::NotFound;
    }
    if msg.contains("invalid argument") || msg.contains("invalid_argument") || msg.contains("ids required") {
        return ErrorCode::InvalidArgument;
    }
    ErrorCode::Internal
}
