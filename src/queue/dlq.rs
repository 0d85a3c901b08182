//! DLQ consumer
//!
//! Independent subscriber on the DLQ topic, in its own consumer group.
//! Each envelope is handed to the retry manager, which enforces the
//! cooling window before requeueing. A malformed record is logged and
//! skipped; it must never block the stream behind it.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::DlqEnvelope;
use crate::error::{PipelineError, Result};

use super::retry::RetryManager;
use super::DLQ_TOPIC;

/// Configuration of the DLQ consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID, distinct from the evaluate group
    pub group_id: String,
    /// DLQ topic
    pub topic: String,
    /// Client-side timeout for one fetch
    pub fetch_timeout: Duration,
    /// Sleep after a fetch error
    pub error_backoff: Duration,
}

impl Default for DlqConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "dlq-processor".to_string(),
            topic: DLQ_TOPIC.to_string(),
            fetch_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(2),
        }
    }
}

impl DlqConsumerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() || self.group_id.is_empty() || self.topic.is_empty() {
            return Err(PipelineError::Config(
                "brokers, group ID and topic are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Poll loop over the DLQ topic feeding the retry manager
pub struct DlqConsumer {
    config: DlqConsumerConfig,
    consumer: StreamConsumer,
    retry_manager: Arc<RetryManager>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DlqConsumer {
    /// Subscribe to the DLQ topic in a dedicated group
    pub fn new(config: DlqConsumerConfig, retry_manager: Arc<RetryManager>) -> Result<Self> {
        config.validate()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, group = %config.group_id, "DLQ consumer subscribed");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            consumer,
            retry_manager,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Signal the poll loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the poll loop until shutdown
    pub async fn run(self) -> Result<()> {
        info!("DLQ consumer started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        while !*shutdown_rx.borrow() {
            let fetched = tokio::select! {
                _ = shutdown_rx.changed() => break,
                fetched = tokio::time::timeout(self.config.fetch_timeout, self.consumer.recv()) => fetched,
            };

            match fetched {
                // Quiet topic; poll again.
                Err(_) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "DLQ fetch error");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Ok(Ok(msg)) => {
                    let Some(bytes) = msg.payload() else {
                        warn!(offset = msg.offset(), "skipping DLQ record with empty payload");
                        continue;
                    };
                    match serde_json::from_slice::<DlqEnvelope>(bytes) {
                        Err(e) => {
                            warn!(
                                offset = msg.offset(),
                                error = %e,
                                "skipping malformed DLQ record"
                            );
                        }
                        Ok(envelope) => {
                            let job_id = envelope.job_id.clone();
                            if let Err(e) =
                                self.retry_manager.process_dlq_job(envelope.dlq_data).await
                            {
                                error!(job_id = %job_id, error = %e, "DLQ job rejected");
                            }
                        }
                    }
                }
            }
        }

        info!("DLQ consumer stopped");
        Ok(())
    }
}
