//! Pipeline worker binary
//!
//! Runs the consumer, DLQ consumer, and HTTP service against a local
//! Redpanda. The repository and AI collaborators wired here are
//! in-memory stand-ins so the messaging subsystem can be exercised end
//! to end on a workstation; a deployment embeds the library and supplies
//! its own implementations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;

use eval_pipeline::clients::{
    AiClient, JobRepository, ResultRepository, UploadRepository,
};
use eval_pipeline::domain::{EvalResult, Job, JobStatus, Upload, UploadKind};
use eval_pipeline::error::{PipelineError, Result};
use eval_pipeline::evaluate::{Evaluator, EvaluatorConfig};
use eval_pipeline::metrics::PipelineMetrics;
use eval_pipeline::queue::{
    admin, AdaptivePollerConfig, AdaptivePollerRegistry, ConsumerConfig, DlqConsumer,
    DlqConsumerConfig, EvaluateConsumer, ProducerConfig, RetryManager, RetryPolicy, TaskProducer,
    TopicSpec,
};
use eval_pipeline::service::PipelineService;

#[derive(Parser)]
#[command(name = "eval-pipeline")]
#[command(about = "Redpanda-backed evaluation pipeline worker", long_about = None)]
struct Cli {
    /// Kafka broker addresses (comma-separated)
    #[arg(long, default_value = "localhost:9092")]
    brokers: String,

    /// Consumer group ID
    #[arg(long, default_value = "evaluate-workers")]
    group_id: String,

    /// Work topic
    #[arg(long, default_value = "evaluate-jobs")]
    topic: String,

    /// DLQ topic
    #[arg(long, default_value = "dlq-jobs")]
    dlq_topic: String,

    /// Stable transactional id of this worker's producer
    #[arg(long, default_value = "evaluate-producer-1")]
    producer_id: String,

    /// Worker pool floor
    #[arg(long, default_value_t = 2)]
    min_workers: usize,

    /// Worker pool ceiling
    #[arg(long, default_value_t = 8)]
    max_workers: usize,

    /// HTTP listen address for health and metrics
    #[arg(long, default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let admin_client = admin::admin_client(&cli.brokers)?;
    admin::ensure_topic_optimized(&admin_client, &TopicSpec::evaluate_default(&cli.topic)).await?;
    admin::ensure_topic(&admin_client, &TopicSpec::dlq_default(&cli.dlq_topic)).await?;

    let metrics = Arc::new(PipelineMetrics::new());

    let producer = Arc::new(TaskProducer::new(ProducerConfig {
        brokers: cli.brokers.clone(),
        transactional_id: cli.producer_id.clone(),
        evaluate_topic: cli.topic.clone(),
        dlq_topic: cli.dlq_topic.clone(),
        ..ProducerConfig::default()
    })?);

    let jobs: Arc<dyn JobRepository> = Arc::new(MemoryJobs::default());
    let uploads: Arc<dyn UploadRepository> = Arc::new(SyntheticUploads);
    let results: Arc<dyn ResultRepository> = Arc::new(MemoryResults::default());
    let ai: Arc<dyn AiClient> = Arc::new(CannedAi);

    let retry_manager = Arc::new(RetryManager::new(
        producer.clone(),
        jobs.clone(),
        RetryPolicy::default(),
        metrics.clone(),
    ));

    let evaluator = Evaluator::new(
        jobs,
        uploads,
        results,
        ai,
        None,
        EvaluatorConfig::default(),
    )
    .with_metrics(metrics.clone());

    let poller_registry = Arc::new(AdaptivePollerRegistry::new(AdaptivePollerConfig::default()));
    poller_registry
        .clone()
        .spawn_sweeper(std::time::Duration::from_secs(300));

    let consumer_config = ConsumerConfig::builder()
        .brokers(cli.brokers.clone())
        .group_id(cli.group_id.clone())
        .topic(cli.topic.clone())
        .workers(cli.min_workers, cli.max_workers)
        .build();
    let consumer = Arc::new(
        EvaluateConsumer::with_metrics(
            consumer_config,
            Arc::new(evaluator),
            Some(retry_manager.clone()),
            metrics.clone(),
        )?
        .with_poller(poller_registry.get_or_create(&cli.topic)),
    );

    let dlq_consumer = DlqConsumer::new(
        DlqConsumerConfig {
            brokers: cli.brokers.clone(),
            topic: cli.dlq_topic.clone(),
            ..DlqConsumerConfig::default()
        },
        retry_manager,
    )?;

    let service = PipelineService::new(consumer.clone(), metrics);
    tokio::spawn(service.serve(cli.http_addr));
    tokio::spawn(dlq_consumer.run());

    info!("pipeline worker running, ctrl-c to stop");
    consumer.run().await?;
    Ok(())
}

/// In-memory job store for smoke runs
#[derive(Default)]
struct MemoryJobs {
    jobs: Mutex<HashMap<String, Job>>,
}

#[async_trait]
impl JobRepository for MemoryJobs {
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let now = Utc::now();
        let job = jobs.entry(job_id.to_string()).or_insert_with(|| Job {
            id: job_id.to_string(),
            status,
            error_message: None,
            created_at: now,
            updated_at: now,
            idempotency_key: None,
        });
        job.status = status;
        job.error_message = error_message.map(str::to_string);
        job.updated_at = now;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id} not found")))
    }
}

/// Upload store that fabricates text for any id, so arbitrary payloads
/// can flow through a smoke run
struct SyntheticUploads;

#[async_trait]
impl UploadRepository for SyntheticUploads {
    async fn get(&self, id: &str) -> Result<Upload> {
        Ok(Upload {
            id: id.to_string(),
            kind: UploadKind::Cv,
            text: format!("synthetic upload body for {id}"),
        })
    }
}

/// In-memory result sink
#[derive(Default)]
struct MemoryResults {
    results: Mutex<HashMap<String, EvalResult>>,
}

#[async_trait]
impl ResultRepository for MemoryResults {
    async fn upsert(&self, result: &EvalResult) -> Result<()> {
        self.results
            .lock()
            .insert(result.job_id.clone(), result.clone());
        Ok(())
    }
}

/// AI stand-in returning a fixed canonical result
struct CannedAi;

#[async_trait]
impl AiClient for CannedAi {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0; 8]).collect())
    }

    async fn chat_json(&self, _system: &str, _user: &str, _max_tokens: usize) -> Result<String> {
        Ok("The candidate looks like a reasonable match for the role.".to_string())
    }

    async fn chat_json_with_retry(
        &self,
        _system: &str,
        _user: &str,
        _max_tokens: usize,
    ) -> Result<String> {
        Ok(r#"{"cv_match_rate":0.75,"cv_feedback":"Relevant experience.","project_score":7.5,"project_feedback":"Covers the brief.","overall_summary":"Credible submission."}"#.to_string())
    }

    async fn clean_cot_response(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}
