//! Transactional task producer
//!
//! One logical publisher with exactly-once semantics to the broker:
//! idempotent producer, stable transactional id, and a one-permit slot so
//! only a single transaction is ever in flight. Concurrent callers
//! serialize on the slot; a caller that gives up while waiting simply
//! drops its acquire future.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::domain::{DlqEnvelope, DlqJob, EvaluateTaskPayload};
use crate::error::{PipelineError, Result};

use super::config::ProducerConfig;

/// Publishing seam consumed by the retry manager and the API layer.
///
/// [`TaskProducer`] is the broker-backed implementation; tests substitute
/// an in-memory one.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Publish an evaluation task; returns the task id (the payload's
    /// `job_id` — re-enqueueing the same job is safe under the broker's
    /// transactional guarantees)
    async fn enqueue_evaluate(&self, payload: &EvaluateTaskPayload) -> Result<String>;

    /// Publish a DLQ envelope for `job_id`
    async fn enqueue_dlq(&self, job_id: &str, dlq_job: &DlqJob) -> Result<()>;
}

/// Transactional producer over the `evaluate-jobs` and `dlq-jobs` topics
pub struct TaskProducer {
    config: ProducerConfig,
    producer: FutureProducer,
    // One permit: at most one in-flight transaction per producer.
    tx_slot: Arc<Semaphore>,
}

impl TaskProducer {
    /// Build the underlying client and initialize transactions.
    ///
    /// Blocks for up to the configured transaction timeout while the
    /// broker fences older incarnations of this transactional id; call it
    /// during startup, before the runtime is busy.
    pub fn new(config: ProducerConfig) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("transactional.id", &config.transactional_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()?;

        producer.init_transactions(Timeout::After(config.transaction_timeout))?;
        info!(
            transactional_id = %config.transactional_id,
            "transactional producer initialized"
        );

        Ok(Self {
            config,
            producer,
            tx_slot: Arc::new(Semaphore::new(1)),
        })
    }

    async fn publish_in_transaction(
        &self,
        topic: &str,
        key: &str,
        body: Vec<u8>,
        headers: OwnedHeaders,
    ) -> Result<()> {
        // The semaphore is never closed, so acquire only fails if the
        // producer itself is gone.
        let _permit = self
            .tx_slot
            .acquire()
            .await
            .map_err(|_| PipelineError::Shutdown("producer closed".to_string()))?;

        self.producer.begin_transaction()?;

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&body)
            .headers(headers);

        let send_result = self
            .producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await;

        match send_result {
            Ok((partition, offset)) => {
                if let Err(e) = self
                    .producer
                    .commit_transaction(Timeout::After(self.config.transaction_timeout))
                {
                    error!(topic, key, error = %e, "transaction commit failed, aborting");
                    self.abort_quietly();
                    return Err(e.into());
                }
                debug!(topic, key, partition, offset, "record committed");
                Ok(())
            }
            Err((e, _record)) => {
                error!(topic, key, error = %e, "produce failed, aborting transaction");
                self.abort_quietly();
                Err(e.into())
            }
        }
    }

    fn abort_quietly(&self) {
        if let Err(abort_err) = self
            .producer
            .abort_transaction(Timeout::After(self.config.transaction_timeout))
        {
            error!(error = %abort_err, "transaction abort failed");
        }
    }
}

#[async_trait]
impl TaskPublisher for TaskProducer {
    async fn enqueue_evaluate(&self, payload: &EvaluateTaskPayload) -> Result<String> {
        let body = serde_json::to_vec(payload)?;
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "job_id",
                value: Some(payload.job_id.as_bytes()),
            })
            .insert(Header {
                key: "cv_id",
                value: Some(payload.cv_id.as_bytes()),
            })
            .insert(Header {
                key: "project_id",
                value: Some(payload.project_id.as_bytes()),
            });

        self.publish_in_transaction(&self.config.evaluate_topic, &payload.job_id, body, headers)
            .await?;
        Ok(payload.job_id.clone())
    }

    async fn enqueue_dlq(&self, job_id: &str, dlq_job: &DlqJob) -> Result<()> {
        let envelope = DlqEnvelope::new(dlq_job.clone());
        let body = serde_json::to_vec(&envelope)?;
        let headers = OwnedHeaders::new().insert(Header {
            key: "job_id",
            value: Some(job_id.as_bytes()),
        });

        self.publish_in_transaction(&self.config.dlq_topic, job_id, body, headers)
            .await
    }
}

impl Drop for TaskProducer {
    fn drop(&mut self) {
        // Flush whatever the last committed transaction left buffered.
        let _ = self.producer.flush(Timeout::After(Duration::from_secs(5)));
    }
}
