//! Redpanda/Kafka messaging subsystem
//!
//! This module is the delivery backbone of the pipeline:
//! - Transactional publishing of evaluation tasks and DLQ envelopes
//! - A read-committed consumer with an adaptive poller and a worker pool
//!   that scales between configured bounds
//! - Retry routing with exponential backoff and a cooled-down DLQ path
//! - Graceful shutdown with bounded in-flight draining
//!
//! # Example
//!
//! ```no_run
//! use eval_pipeline::queue::{ConsumerConfig, EvaluateConsumer, EvaluateHandler};
//! use eval_pipeline::domain::EvaluateTaskPayload;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct LoggingHandler;
//!
//! #[async_trait]
//! impl EvaluateHandler for LoggingHandler {
//!     async fn handle_evaluate(&self, payload: &EvaluateTaskPayload) -> eval_pipeline::Result<()> {
//!         tracing::info!(job_id = %payload.job_id, "evaluating");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> eval_pipeline::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092".to_string())
//!     .group_id("evaluate-workers".to_string())
//!     .build();
//!
//! let consumer = Arc::new(EvaluateConsumer::new(config, Arc::new(LoggingHandler), None)?);
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod poller;
pub mod processor;
pub mod producer;
pub mod retry;
pub mod shutdown;

pub use admin::{ensure_topic, ensure_topic_optimized, TopicSpec};
pub use config::{ConsumerConfig, ConsumerConfigBuilder, ProducerConfig};
pub use consumer::{ConsumerHealth, EvaluateConsumer};
pub use dlq::{DlqConsumer, DlqConsumerConfig};
pub use poller::{AdaptivePoller, AdaptivePollerConfig, AdaptivePollerRegistry, AdaptivePollerSnapshot};
pub use processor::EvaluateHandler;
pub use producer::{TaskProducer, TaskPublisher};
pub use retry::{RetryManager, RetryPolicy};
pub use shutdown::ShutdownState;

/// Main work topic carrying evaluation tasks
pub const EVALUATE_TOPIC: &str = "evaluate-jobs";
/// Side topic accumulating throttled or unprocessable jobs
pub const DLQ_TOPIC: &str = "dlq-jobs";
