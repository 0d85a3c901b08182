//! Handler seam between the consumer and the evaluation orchestrator

use async_trait::async_trait;

use crate::domain::EvaluateTaskPayload;
use crate::error::Result;

/// Processes one decoded evaluation task end to end.
///
/// The consumer owns decoding and offset bookkeeping; implementations own
/// everything from the payload onward (LLM chain, persistence, terminal
/// job status). Returning an error tells the consumer the record was not
/// handled — it is then either routed to the retry manager or left
/// uncommitted for re-delivery.
#[async_trait]
pub trait EvaluateHandler: Send + Sync + 'static {
    /// Process a single evaluation task
    async fn handle_evaluate(&self, payload: &EvaluateTaskPayload) -> Result<()>;
}
