//! Read-committed consumer with an adaptively paced fetcher and a
//! dynamically scaled worker pool
//!
//! One fetcher task paces polls off the adaptive poller and feeds a
//! bounded job queue; between `min_workers` and `max_workers` worker
//! tasks drain it. A scaler task grows the pool toward the queue length,
//! and workers shed themselves when capacity exceeds demand. A full
//! queue never blocks the fetch loop — overflow records are processed in
//! transient tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::EvaluateTaskPayload;
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;

use super::config::ConsumerConfig;
use super::poller::{AdaptivePoller, AdaptivePollerConfig, AdaptivePollerSnapshot};
use super::processor::EvaluateHandler;
use super::retry::RetryManager;
use super::shutdown::ShutdownState;

/// How often the scaler re-evaluates the pool size
const SCALER_INTERVAL: Duration = Duration::from_secs(2);
/// Inner drain timeout after a successful fetch
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Base sleep after a transient fetch error
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Health snapshot exposed by the service layer
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHealth {
    /// Workers currently alive
    pub active_workers: usize,
    /// Configured pool floor
    pub min_workers: usize,
    /// Configured pool ceiling
    pub max_workers: usize,
    /// Records waiting in the in-process queue
    pub queue_length: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Records currently being processed
    pub inflight_jobs: usize,
    /// False while the poller circuit is open
    pub is_healthy: bool,
    /// Poller counters
    pub poller: AdaptivePollerSnapshot,
}

/// Consumer over `evaluate-jobs` dispatching records to a worker pool
pub struct EvaluateConsumer<H: EvaluateHandler> {
    config: ConsumerConfig,
    handler: Arc<H>,
    retry_manager: Option<Arc<RetryManager>>,
    session: RwLock<Arc<StreamConsumer>>,
    job_tx: async_channel::Sender<OwnedMessage>,
    job_rx: async_channel::Receiver<OwnedMessage>,
    active_workers: RwLock<usize>,
    worker_seq: AtomicUsize,
    poller: Arc<AdaptivePoller>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_state: Arc<ShutdownState>,
    metrics: Arc<PipelineMetrics>,
}

impl<H: EvaluateHandler> EvaluateConsumer<H> {
    /// Create a consumer joined to the configured group.
    ///
    /// With a retry manager attached, upstream-pressure failures
    /// (rate limit, timeout) are routed to it instead of being surfaced
    /// for re-delivery.
    pub fn new(
        config: ConsumerConfig,
        handler: Arc<H>,
        retry_manager: Option<Arc<RetryManager>>,
    ) -> Result<Self> {
        Self::with_metrics(config, handler, retry_manager, Arc::new(PipelineMetrics::new()))
    }

    /// Like [`new`](Self::new) with shared metrics
    pub fn with_metrics(
        config: ConsumerConfig,
        handler: Arc<H>,
        retry_manager: Option<Arc<RetryManager>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        config.validate().map_err(PipelineError::Config)?;

        let session = Self::build_session(&config)?;
        let (job_tx, job_rx) = async_channel::bounded(config.queue_capacity());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            handler,
            retry_manager,
            session: RwLock::new(Arc::new(session)),
            job_tx,
            job_rx,
            active_workers: RwLock::new(0),
            worker_seq: AtomicUsize::new(0),
            poller: Arc::new(AdaptivePoller::new(AdaptivePollerConfig::default())),
            shutdown_tx,
            shutdown_rx,
            shutdown_state: Arc::new(ShutdownState::new()),
            metrics,
        })
    }

    fn build_session(config: &ConsumerConfig) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("isolation.level", "read_committed")
            // Commit-marks: offsets are stored explicitly after each
            // processed record, then auto-committed on the interval.
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                config.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.max_poll_interval_ms.to_string(),
            )
            .set(
                "socket.timeout.ms",
                config.dial_timeout.as_millis().to_string(),
            )
            .set("fetch.max.bytes", config.fetch_max_bytes.to_string())
            .set("fetch.min.bytes", config.fetch_min_bytes.to_string())
            .set(
                "max.partition.fetch.bytes",
                config.max_partition_fetch_bytes.to_string(),
            )
            .set("fetch.wait.max.ms", config.fetch_max_wait_ms.to_string())
            .set("auto.offset.reset", &config.auto_offset_reset)
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(
            topic = %config.topic,
            group = %config.group_id,
            "consumer session joined"
        );
        Ok(consumer)
    }

    /// Run fetcher, scaler, and the initial worker pool until shutdown,
    /// then drain within the configured window
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "starting evaluate consumer"
        );

        for _ in 0..self.config.min_workers {
            Self::try_spawn_worker(&self);
        }
        let fetcher = self.clone().spawn_fetcher();
        let scaler = self.clone().spawn_scaler();

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                let _ = self.shutdown_tx.send(true);
            }
        }

        self.shutdown_state.begin_shutdown();
        let remaining = self
            .shutdown_state
            .wait_for_drain(self.config.shutdown_timeout)
            .await;
        if remaining > 0 {
            warn!(remaining, "shutdown drain window elapsed with jobs in flight");
        }

        // Flush the last stored offsets before the session drops.
        if let Err(e) = self
            .current_session()
            .commit_consumer_state(CommitMode::Sync)
        {
            warn!(error = %e, "final offset commit failed");
        }

        for (name, handle) in [("fetcher", fetcher), ("scaler", scaler)] {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(task = name, "task did not stop in time");
            }
        }

        info!("consumer shutdown complete");
        Ok(())
    }

    /// Signal shutdown; `run` performs the drain
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current health snapshot
    pub fn health(&self) -> ConsumerHealth {
        ConsumerHealth {
            active_workers: *self.active_workers.read(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            queue_length: self.job_rx.len(),
            queue_capacity: self.config.queue_capacity(),
            inflight_jobs: self.shutdown_state.inflight_count(),
            is_healthy: self.poller.is_healthy(),
            poller: self.poller.stats(),
        }
    }

    /// Shared metrics handle
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Use a poller shared through an
    /// [`AdaptivePollerRegistry`](super::AdaptivePollerRegistry) instead
    /// of a private one
    pub fn with_poller(mut self, poller: Arc<AdaptivePoller>) -> Self {
        self.poller = poller;
        self
    }

    fn current_session(&self) -> Arc<StreamConsumer> {
        self.session.read().clone()
    }

    fn rebuild_session(&self) -> Result<()> {
        warn!("rebuilding consumer session");
        let fresh = Self::build_session(&self.config)?;
        *self.session.write() = Arc::new(fresh);
        self.poller.reset();
        Ok(())
    }

    fn spawn_fetcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_rx.clone();
            let mut poll_failures: u32 = 0;

            'fetch: while !*shutdown_rx.borrow() {
                let interval = self.poller.next_interval();
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if !self.poller.is_healthy() {
                    if let Err(e) = self.rebuild_session() {
                        warn!(error = %e, "session rebuild failed");
                    }
                }

                let session = self.current_session();
                match tokio::time::timeout(self.config.poll_timeout, session.recv()).await {
                    // Nothing fetched within the window; not a failure.
                    Err(_) => {}
                    Ok(Ok(msg)) => {
                        self.poller.record_success();
                        poll_failures = 0;
                        self.metrics.record_consumed();
                        Self::dispatch(&self, msg.detach());

                        // Drain the rest of this fetch before sleeping again.
                        loop {
                            match tokio::time::timeout(DRAIN_TIMEOUT, session.recv()).await {
                                Ok(Ok(more)) => {
                                    self.metrics.record_consumed();
                                    Self::dispatch(&self, more.detach());
                                }
                                Ok(Err(e)) => {
                                    if self.note_fetch_error(e, &mut poll_failures).await {
                                        break 'fetch;
                                    }
                                    break;
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        if self.note_fetch_error(e, &mut poll_failures).await {
                            break 'fetch;
                        }
                    }
                }
            }
            info!("fetcher stopped");
        })
    }

    /// Record a fetch error; returns true when it is fatal
    async fn note_fetch_error(&self, error: KafkaError, poll_failures: &mut u32) -> bool {
        if is_fatal(&error) {
            error!(error = %error, "fatal fetch error, stopping fetcher");
            return true;
        }
        self.poller.record_failure();
        self.metrics.record_fetch_error();
        *poll_failures += 1;
        let backoff = FETCH_ERROR_BACKOFF * 2u32.saturating_pow((*poll_failures).min(6));
        warn!(
            error = %error,
            poll_failures,
            backoff_ms = backoff.as_millis() as u64,
            "transient fetch error"
        );
        tokio::time::sleep(backoff).await;
        false
    }

    fn dispatch(this: &Arc<Self>, msg: OwnedMessage) {
        match this.job_tx.try_send(msg) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(msg)) => {
                // Queue saturated: handle the record in a transient task
                // rather than stalling the fetch loop.
                warn!("job queue full, processing record out of band");
                this.metrics.record_queue_overflow();
                this.shutdown_state.add_inflight_job();
                let consumer = this.clone();
                tokio::spawn(async move {
                    consumer.handle_record(msg).await;
                    consumer.shutdown_state.remove_inflight_job();
                });
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                warn!("job queue closed, dropping record");
            }
        }
    }

    /// Spawn a worker if the pool ceiling allows it.
    ///
    /// The count is re-checked and incremented under the write lock so a
    /// burst of scaler ticks cannot overshoot `max_workers`.
    fn try_spawn_worker(this: &Arc<Self>) -> bool {
        let worker_id = {
            let mut active = this.active_workers.write();
            if *active >= this.config.max_workers {
                return false;
            }
            *active += 1;
            this.worker_seq.fetch_add(1, Ordering::Relaxed)
        };

        let consumer = this.clone();
        tokio::spawn(async move {
            consumer.worker_loop(worker_id).await;
        });
        true
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut scaled_down = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                job = self.job_rx.recv() => {
                    let msg = match job {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    self.shutdown_state.add_inflight_job();
                    self.handle_record(msg).await;
                    self.shutdown_state.remove_inflight_job();

                    // Shed this worker when capacity exceeds demand.
                    {
                        let mut active = self.active_workers.write();
                        if *active > self.config.min_workers
                            && (self.job_rx.is_empty() || *active > self.job_rx.len())
                        {
                            *active -= 1;
                            scaled_down = true;
                        }
                    }
                    if scaled_down {
                        debug!(worker_id, "worker scaling down");
                        break;
                    }
                }
            }
        }

        if !scaled_down {
            let mut active = self.active_workers.write();
            *active = active.saturating_sub(1);
        }
        debug!(worker_id, "worker stopped");
    }

    fn spawn_scaler(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(SCALER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let queue_len = self.job_rx.len();
                        if queue_len == 0 {
                            continue;
                        }
                        let active = *self.active_workers.read();
                        if active >= self.config.max_workers {
                            continue;
                        }
                        let target = queue_len.min(self.config.max_workers - active);
                        let mut spawned = 0;
                        for _ in 0..target {
                            if !Self::try_spawn_worker(&self) {
                                break;
                            }
                            spawned += 1;
                        }
                        if spawned > 0 {
                            info!(spawned, queue_len, "scaled up workers");
                        }
                    }
                }
            }
            info!("scaler stopped");
        })
    }

    async fn handle_record(&self, msg: OwnedMessage) {
        match self.process_record(&msg).await {
            Ok(()) => {
                self.metrics.record_processed();
                // Mark the offset; the session auto-commits marks on its
                // interval. Unhandled records are never marked, so the
                // transactional session re-delivers them.
                if let Err(e) =
                    self.current_session()
                        .store_offset(msg.topic(), msg.partition(), msg.offset())
                {
                    warn!(
                        topic = msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        error = %e,
                        "failed to store offset"
                    );
                }
            }
            Err(e) => {
                self.metrics.record_failed();
                error!(
                    topic = msg.topic(),
                    partition = msg.partition(),
                    offset = msg.offset(),
                    error = %e,
                    "record processing failed"
                );
            }
        }
    }

    async fn process_record(&self, msg: &OwnedMessage) -> Result<()> {
        let bytes = msg
            .payload()
            .ok_or_else(|| PipelineError::SchemaInvalid("empty record payload".to_string()))?;
        let payload: EvaluateTaskPayload = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::SchemaInvalid(format!("payload decode failed: {e}")))?;

        let span = info_span!(
            "process_record",
            job_id = %payload.job_id,
            request_id = payload.request_id.as_deref().unwrap_or_default(),
        );
        async {
            match self.handler.handle_evaluate(&payload).await {
                Ok(()) => {
                    if let Some(rm) = &self.retry_manager {
                        rm.clear(&payload.job_id);
                    }
                    info!("record processed");
                    Ok(())
                }
                Err(e) => {
                    if let Some(rm) = &self.retry_manager {
                        if e.code().is_upstream_pressure() {
                            info!(code = %e.code(), "routing failure to retry manager");
                            rm.handle_failure(&payload, &e).await?;
                            return Ok(());
                        }
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn is_fatal(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::Canceled | KafkaError::ClientCreation(_) | KafkaError::ClientConfig(_, _, _, _)
    ) || matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Fatal | RDKafkaErrorCode::Authentication)
    )
}
