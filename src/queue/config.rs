//! Consumer and producer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{DLQ_TOPIC, EVALUATE_TOPIC};

/// Configuration of the evaluate consumer and its worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Topic to consume from
    pub topic: String,

    /// Lower bound of the worker pool
    pub min_workers: usize,

    /// Upper bound of the worker pool
    pub max_workers: usize,

    /// Connection dial timeout
    pub dial_timeout: Duration,

    /// Group session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u32,

    /// Maximum interval between polls before the group rebalances the
    /// member out (librdkafka's rebalance deadline)
    pub max_poll_interval_ms: u32,

    /// Upper bound on one fetch response
    pub fetch_max_bytes: u32,

    /// Broker waits for at least this many bytes before answering a fetch
    pub fetch_min_bytes: u32,

    /// Upper bound per partition in one fetch response
    pub max_partition_fetch_bytes: u32,

    /// Broker-side max wait for a fetch in milliseconds
    pub fetch_max_wait_ms: u32,

    /// Interval between automatic commits of stored offsets
    pub auto_commit_interval_ms: u32,

    /// Client-side timeout for one poll
    pub poll_timeout: Duration,

    /// Offset reset policy (earliest, latest)
    pub auto_offset_reset: String,

    /// Bounded wait for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "evaluate-workers".to_string(),
            topic: EVALUATE_TOPIC.to_string(),
            min_workers: 2,
            max_workers: num_cpus::get().max(4),
            dial_timeout: Duration::from_secs(10),
            session_timeout_ms: 20_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
            fetch_max_bytes: 10 * 1024 * 1024,
            fetch_min_bytes: 512,
            max_partition_fetch_bytes: 2 * 1024 * 1024,
            fetch_max_wait_ms: 2_000,
            auto_commit_interval_ms: 1_000,
            poll_timeout: Duration::from_secs(10),
            auto_offset_reset: "earliest".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Capacity of the in-process job queue
    pub fn queue_capacity(&self) -> usize {
        2 * self.max_workers
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("brokers cannot be empty".to_string());
        }
        if self.group_id.is_empty() {
            return Err("group ID cannot be empty".to_string());
        }
        if self.topic.is_empty() {
            return Err("topic cannot be empty".to_string());
        }
        if self.min_workers == 0 {
            return Err("min_workers must be greater than 0".to_string());
        }
        if self.max_workers < self.min_workers {
            return Err("max_workers must be at least min_workers".to_string());
        }
        if self.heartbeat_interval_ms * 3 > self.session_timeout_ms {
            return Err("session timeout must be at least 3x the heartbeat interval".to_string());
        }
        if self.poll_timeout.is_zero() {
            return Err("poll timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Builder for [`ConsumerConfig`]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: String) -> Self {
        self.config.brokers = brokers;
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: String) -> Self {
        self.config.group_id = group_id;
        self
    }

    /// Set the topic to consume
    pub fn topic(mut self, topic: String) -> Self {
        self.config.topic = topic;
        self
    }

    /// Set the worker pool bounds
    pub fn workers(mut self, min: usize, max: usize) -> Self {
        self.config.min_workers = min;
        self.config.max_workers = max;
        self
    }

    pub fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.config.session_timeout_ms = timeout;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn auto_offset_reset(mut self, policy: String) -> Self {
        self.config.auto_offset_reset = policy;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the transactional task producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Transactional identifier, stable across restarts for the same
    /// logical producer, unique across concurrent producers
    pub transactional_id: String,

    /// Topic evaluation tasks are published to
    pub evaluate_topic: String,

    /// Topic DLQ envelopes are published to
    pub dlq_topic: String,

    /// Delivery timeout for one produce
    pub message_timeout: Duration,

    /// Timeout for transaction init/commit/abort calls
    pub transaction_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            transactional_id: "evaluate-producer".to_string(),
            evaluate_topic: EVALUATE_TOPIC.to_string(),
            dlq_topic: DLQ_TOPIC.to_string(),
            message_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(10),
        }
    }
}

impl ProducerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("brokers cannot be empty".to_string());
        }
        if self.transactional_id.is_empty() {
            return Err("transactional ID cannot be empty".to_string());
        }
        if self.evaluate_topic.is_empty() || self.dlq_topic.is_empty() {
            return Err("topics cannot be empty".to_string());
        }
        Ok(())
    }
}
