//! Adaptive polling intervals with a circuit-breaker fallback
//!
//! A feedback controller over fetch cadence: consecutive successes narrow
//! the interval toward `min_interval`, a failure majority widens it
//! exponentially, and sustained failure opens the circuit and pins the
//! interval at `max_interval` until health returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consecutive failures that open the circuit
const CIRCUIT_OPEN_THRESHOLD: u32 = 10;
/// Jitter applied to backoff intervals
const JITTER_FRACTION: f64 = 0.1;
/// Pollers idle longer than this are discarded by the registry sweeper
const IDLE_EVICTION_AGE: Duration = Duration::from_secs(3600);

/// Interval bounds and backoff shape for one poller
#[derive(Debug, Clone)]
pub struct AdaptivePollerConfig {
    /// Interval under neutral conditions
    pub base_interval: Duration,
    /// Tightest interval under sustained success
    pub min_interval: Duration,
    /// Widest interval; also the circuit-open interval
    pub max_interval: Duration,
    /// Exponential growth factor under failure
    pub backoff_factor: f64,
}

impl Default for AdaptivePollerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug)]
struct PollerState {
    success_count: u64,
    failure_count: u64,
    consecutive_success: u32,
    consecutive_failure: u32,
    is_healthy: bool,
    last_poll_time: Instant,
    last_success_time: Option<Instant>,
    last_failure_time: Option<Instant>,
}

impl PollerState {
    fn new() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            consecutive_success: 0,
            consecutive_failure: 0,
            is_healthy: true,
            last_poll_time: Instant::now(),
            last_success_time: None,
            last_failure_time: None,
        }
    }
}

/// Read-only snapshot of a poller, exposed on the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AdaptivePollerSnapshot {
    /// Total successful polls
    pub success_count: u64,
    /// Total failed polls
    pub failure_count: u64,
    /// Current success streak
    pub consecutive_success: u32,
    /// Current failure streak
    pub consecutive_failure: u32,
    /// False while the circuit is open
    pub is_healthy: bool,
    /// Seconds since the last successful poll, if any
    pub seconds_since_last_success: Option<u64>,
    /// Seconds since the last failed poll, if any
    pub seconds_since_last_failure: Option<u64>,
}

/// Feedback controller over polling intervals
#[derive(Debug)]
pub struct AdaptivePoller {
    config: AdaptivePollerConfig,
    state: Mutex<PollerState>,
}

impl AdaptivePoller {
    /// Poller with the given bounds
    pub fn new(config: AdaptivePollerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PollerState::new()),
        }
    }

    /// Poller with default bounds
    pub fn with_defaults() -> Self {
        Self::new(AdaptivePollerConfig::default())
    }

    /// Compute the next polling interval from the recorded history.
    ///
    /// Always within `[min_interval, max_interval]`. A failure streak of
    /// [`CIRCUIT_OPEN_THRESHOLD`] opens the circuit: the poller reports
    /// unhealthy and pins the interval at the maximum.
    pub fn next_interval(&self) -> Duration {
        let mut state = self.state.lock();
        state.last_poll_time = Instant::now();

        if state.consecutive_failure >= CIRCUIT_OPEN_THRESHOLD {
            if state.is_healthy {
                warn!(
                    consecutive_failures = state.consecutive_failure,
                    "poller circuit opened, pinning interval at max"
                );
            }
            state.is_healthy = false;
            return self.config.max_interval;
        }

        let interval = if state.failure_count > state.success_count {
            let multiplier = self
                .config
                .backoff_factor
                .powi(state.consecutive_failure.min(30) as i32);
            let backed_off = self.config.base_interval.mul_f64(multiplier);
            with_jitter(backed_off.min(self.config.max_interval))
        } else {
            let shrink = (1.0 / (state.consecutive_success as f64 + 1.0)).max(0.5);
            self.config.base_interval.mul_f64(shrink)
        };

        interval.clamp(self.config.min_interval, self.config.max_interval)
    }

    /// Record a successful poll
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.success_count += 1;
        state.consecutive_success += 1;
        state.consecutive_failure = 0;
        state.is_healthy = true;
        state.last_success_time = Some(Instant::now());
    }

    /// Record a failed poll
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.consecutive_failure += 1;
        state.consecutive_success = 0;
        state.is_healthy = false;
        state.last_failure_time = Some(Instant::now());
        debug!(
            consecutive_failures = state.consecutive_failure,
            "poll failure recorded"
        );
    }

    /// Zero all counters and mark healthy
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = PollerState::new();
    }

    /// Whether the circuit is closed
    pub fn is_healthy(&self) -> bool {
        self.state.lock().is_healthy
    }

    /// How long since this poller was last asked for an interval
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_poll_time.elapsed()
    }

    /// Read-only snapshot for metrics and health endpoints
    pub fn stats(&self) -> AdaptivePollerSnapshot {
        let state = self.state.lock();
        AdaptivePollerSnapshot {
            success_count: state.success_count,
            failure_count: state.failure_count,
            consecutive_success: state.consecutive_success,
            consecutive_failure: state.consecutive_failure,
            is_healthy: state.is_healthy,
            seconds_since_last_success: state.last_success_time.map(|t| t.elapsed().as_secs()),
            seconds_since_last_failure: state.last_failure_time.map(|t| t.elapsed().as_secs()),
        }
    }
}

fn with_jitter(interval: Duration) -> Duration {
    // ±10%
    let spread = 1.0 + JITTER_FRACTION * (2.0 * rand::random::<f64>() - 1.0);
    interval.mul_f64(spread)
}

/// Per-topic pollers, created on first access and swept when idle
pub struct AdaptivePollerRegistry {
    config: AdaptivePollerConfig,
    pollers: RwLock<HashMap<String, Arc<AdaptivePoller>>>,
}

impl AdaptivePollerRegistry {
    /// Registry whose pollers share one configuration
    pub fn new(config: AdaptivePollerConfig) -> Self {
        Self {
            config,
            pollers: RwLock::new(HashMap::new()),
        }
    }

    /// The poller for `topic`, created on first access
    pub fn get_or_create(&self, topic: &str) -> Arc<AdaptivePoller> {
        if let Some(poller) = self.pollers.read().get(topic) {
            return poller.clone();
        }
        let mut pollers = self.pollers.write();
        pollers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(AdaptivePoller::new(self.config.clone())))
            .clone()
    }

    /// Number of live pollers
    pub fn len(&self) -> usize {
        self.pollers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.pollers.read().is_empty()
    }

    /// Discard pollers idle for longer than the eviction age
    pub fn sweep(&self) -> usize {
        let mut pollers = self.pollers.write();
        let before = pollers.len();
        pollers.retain(|topic, poller| {
            let keep = poller.idle_for() < IDLE_EVICTION_AGE;
            if !keep {
                info!(topic, "discarding idle poller");
            }
            keep
        });
        before - pollers.len()
    }

    /// Background sweeper discarding idle pollers periodically
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep();
                if evicted > 0 {
                    debug!(evicted, "poller registry swept");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AdaptivePollerConfig {
        AdaptivePollerConfig {
            base_interval: Duration::from_secs(2),
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_interval_always_within_bounds() {
        let poller = AdaptivePoller::new(test_config());
        for i in 0..50 {
            if i % 3 == 0 {
                poller.record_failure();
            } else {
                poller.record_success();
            }
            let interval = poller.next_interval();
            assert!(interval >= Duration::from_millis(500), "{interval:?}");
            assert!(interval <= Duration::from_secs(10), "{interval:?}");
        }
    }

    #[test]
    fn test_backoff_grows_under_failure() {
        let poller = AdaptivePoller::new(test_config());
        for _ in 0..5 {
            poller.record_failure();
        }
        let interval = poller.next_interval();
        assert!(interval > Duration::from_secs(2), "{interval:?}");
        assert!(interval <= Duration::from_secs(10), "{interval:?}");
        assert!(!poller.is_healthy());
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let poller = AdaptivePoller::new(test_config());
        for _ in 0..10 {
            poller.record_failure();
        }
        assert_eq!(poller.next_interval(), Duration::from_secs(10));
        assert!(!poller.is_healthy());

        let stats = poller.stats();
        assert_eq!(stats.consecutive_failure, 10);
        assert!(!stats.is_healthy);
    }

    #[test]
    fn test_success_narrows_toward_min() {
        let poller = AdaptivePoller::new(test_config());
        for _ in 0..8 {
            poller.record_success();
        }
        let interval = poller.next_interval();
        // base * max(0.5, 1/9) = 1s
        assert_eq!(interval, Duration::from_secs(1));
        assert!(poller.is_healthy());
    }

    #[test]
    fn test_reset_restores_base_behavior() {
        let poller = AdaptivePoller::new(test_config());
        for _ in 0..10 {
            poller.record_failure();
        }
        assert!(!poller.is_healthy());

        poller.reset();
        assert!(poller.is_healthy());
        // no history: neutral path, base interval
        assert_eq!(poller.next_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let poller = AdaptivePoller::new(test_config());
        for _ in 0..9 {
            poller.record_failure();
        }
        poller.record_success();
        let stats = poller.stats();
        assert_eq!(stats.consecutive_failure, 0);
        assert!(stats.is_healthy);
    }

    #[test]
    fn test_registry_creates_and_reuses() {
        let registry = AdaptivePollerRegistry::new(test_config());
        let a = registry.get_or_create("evaluate-jobs");
        let b = registry.get_or_create("evaluate-jobs");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        registry.get_or_create("dlq-jobs");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_sweep_keeps_active_pollers() {
        let registry = AdaptivePollerRegistry::new(test_config());
        let poller = registry.get_or_create("evaluate-jobs");
        poller.next_interval();
        assert_eq!(registry.sweep(), 0);
        assert_eq!(registry.len(), 1);
    }
}
