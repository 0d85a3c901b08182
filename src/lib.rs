//! Resilient Redpanda-backed evaluation pipeline
//!
//! Delivers evaluation tasks from API producers to a pool of workers that
//! invoke an external LLM service, persist results, and survive the
//! failure modes of both the broker and the provider: transactional
//! delivery, adaptive polling with a circuit breaker, a dynamically
//! scaled worker pool, structured response repair, and retry routing
//! with a cooled-down dead letter queue.
//!
//! # Example
//!
//! ```no_run
//! use eval_pipeline::clients::{AiClient, JobRepository, ResultRepository, UploadRepository};
//! use eval_pipeline::evaluate::{Evaluator, EvaluatorConfig};
//! use eval_pipeline::queue::{ConsumerConfig, EvaluateConsumer};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     jobs: Arc<dyn JobRepository>,
//! #     uploads: Arc<dyn UploadRepository>,
//! #     results: Arc<dyn ResultRepository>,
//! #     ai: Arc<dyn AiClient>,
//! # ) -> eval_pipeline::Result<()> {
//! let evaluator = Evaluator::new(jobs, uploads, results, ai, None, EvaluatorConfig::default());
//!
//! let config = ConsumerConfig::builder()
//!     .brokers("localhost:9092".to_string())
//!     .group_id("evaluate-workers".to_string())
//!     .workers(2, 8)
//!     .build();
//!
//! let consumer = Arc::new(EvaluateConsumer::new(config, Arc::new(evaluator), None)?);
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

// Re-export commonly used items
pub use domain::{EvalResult, EvaluateTaskPayload, Job, JobStatus, TokenUsage};
pub use error::{classify_failure_code, ErrorCode, PipelineError, Result};

/// Collaborator interfaces (repositories, AI client, vector client)
pub mod clients;

/// Wire and persistence shapes
pub mod domain;

/// Error types and failure classification
pub mod error;

/// Evaluation orchestrator, prompts, RAG, and response repair
pub mod evaluate;

/// Pipeline counters and histograms
pub mod metrics;

/// Redpanda/Kafka messaging subsystem
pub mod queue;

/// HTTP health and metrics surface
pub mod service;

/// Token counting per model family
pub mod tokens;
