//! Typed, immutable option snapshots governing command and pool behavior.
//!
//! A command reads one [`CommandProperties`] snapshot for its whole life; a
//! pool reads one [`ThreadPoolProperties`]. Tuning at runtime means handing
//! new snapshots to new commands, never mutating a live one.

use crate::keys::{CommandKey, PoolKey};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Mechanism bounding concurrent executions of one command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsolationStrategy {
    /// Submit the run body to a bounded worker pool; the caller waits with a
    /// timeout and may abandon the worker.
    Thread,
    /// Run the body inline on the caller, gated by a counting permit. The
    /// runtime enforces no timeout; the caller owns latency.
    Semaphore,
}

/// Per-command option snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CommandProperties {
    /// Disables breaker gating entirely when false (a no-op breaker is used).
    pub circuit_breaker_enabled: bool,
    /// Minimum requests in the rolling window before the breaker may trip.
    pub circuit_breaker_request_volume_threshold: u64,
    /// Error percentage at or above which the breaker opens.
    pub circuit_breaker_error_threshold_percentage: u64,
    /// How long an open breaker waits before admitting a single test request.
    pub circuit_breaker_sleep_window: Duration,
    /// Administrative override: reject everything.
    pub circuit_breaker_force_open: bool,
    /// Administrative override: allow everything (counts still recorded).
    pub circuit_breaker_force_closed: bool,

    pub execution_isolation_strategy: IsolationStrategy,
    /// Wall-clock budget from run start (thread strategy only).
    pub execution_timeout: Duration,
    /// Whether a timeout also signals the worker to abandon the run body.
    pub execution_interrupt_on_timeout: bool,
    /// Execution-permit count when the strategy is `Semaphore`.
    pub execution_semaphore_max_concurrent_requests: u32,
    /// Force worker pool selection by name instead of the group key.
    pub thread_pool_key_override: Option<PoolKey>,

    pub fallback_enabled: bool,
    /// Concurrent fallback executions allowed per command class.
    pub fallback_semaphore_max_concurrent_requests: u32,

    pub request_cache_enabled: bool,
    pub request_log_enabled: bool,

    /// Sliding window over which event counters aggregate.
    pub metrics_rolling_stats_window: Duration,
    /// Bucket count; window / buckets = bucket duration.
    pub metrics_rolling_stats_buckets: u32,
    pub metrics_rolling_percentile_enabled: bool,
    pub metrics_rolling_percentile_window: Duration,
    pub metrics_rolling_percentile_buckets: u32,
    /// Latency samples retained per percentile bucket before overwriting.
    pub metrics_rolling_percentile_bucket_size: usize,
    /// How long a computed health snapshot may be served before recomputing.
    /// Zero recomputes on every read.
    pub metrics_health_snapshot_interval: Duration,
}

impl Default for CommandProperties {
    fn default() -> Self {
        Self {
            circuit_breaker_enabled: true,
            circuit_breaker_request_volume_threshold: 20,
            circuit_breaker_error_threshold_percentage: 50,
            circuit_breaker_sleep_window: Duration::from_millis(5000),
            circuit_breaker_force_open: false,
            circuit_breaker_force_closed: false,

            execution_isolation_strategy: IsolationStrategy::Thread,
            execution_timeout: Duration::from_millis(1000),
            execution_interrupt_on_timeout: true,
            execution_semaphore_max_concurrent_requests: 10,
            thread_pool_key_override: None,

            fallback_enabled: true,
            fallback_semaphore_max_concurrent_requests: 10,

            request_cache_enabled: true,
            request_log_enabled: true,

            metrics_rolling_stats_window: Duration::from_millis(10_000),
            metrics_rolling_stats_buckets: 10,
            metrics_rolling_percentile_enabled: true,
            metrics_rolling_percentile_window: Duration::from_millis(60_000),
            metrics_rolling_percentile_buckets: 6,
            metrics_rolling_percentile_bucket_size: 100,
            metrics_health_snapshot_interval: Duration::from_millis(500),
        }
    }
}

impl CommandProperties {
    pub fn with_circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }

    pub fn with_request_volume_threshold(mut self, threshold: u64) -> Self {
        self.circuit_breaker_request_volume_threshold = threshold;
        self
    }

    pub fn with_error_threshold_percentage(mut self, percentage: u64) -> Self {
        self.circuit_breaker_error_threshold_percentage = percentage;
        self
    }

    pub fn with_sleep_window(mut self, window: Duration) -> Self {
        self.circuit_breaker_sleep_window = window;
        self
    }

    pub fn with_force_open(mut self, force: bool) -> Self {
        self.circuit_breaker_force_open = force;
        self
    }

    pub fn with_force_closed(mut self, force: bool) -> Self {
        self.circuit_breaker_force_closed = force;
        self
    }

    pub fn with_isolation_strategy(mut self, strategy: IsolationStrategy) -> Self {
        self.execution_isolation_strategy = strategy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_interrupt_on_timeout(mut self, interrupt: bool) -> Self {
        self.execution_interrupt_on_timeout = interrupt;
        self
    }

    pub fn with_execution_semaphore_max(mut self, max: u32) -> Self {
        self.execution_semaphore_max_concurrent_requests = max;
        self
    }

    pub fn with_thread_pool_key_override(mut self, key: PoolKey) -> Self {
        self.thread_pool_key_override = Some(key);
        self
    }

    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_fallback_semaphore_max(mut self, max: u32) -> Self {
        self.fallback_semaphore_max_concurrent_requests = max;
        self
    }

    pub fn with_request_cache_enabled(mut self, enabled: bool) -> Self {
        self.request_cache_enabled = enabled;
        self
    }

    pub fn with_request_log_enabled(mut self, enabled: bool) -> Self {
        self.request_log_enabled = enabled;
        self
    }

    pub fn with_rolling_stats(mut self, window: Duration, buckets: u32) -> Self {
        self.metrics_rolling_stats_window = window;
        self.metrics_rolling_stats_buckets = buckets;
        self
    }

    pub fn with_percentile_enabled(mut self, enabled: bool) -> Self {
        self.metrics_rolling_percentile_enabled = enabled;
        self
    }

    pub fn with_health_snapshot_interval(mut self, interval: Duration) -> Self {
        self.metrics_health_snapshot_interval = interval;
        self
    }
}

/// Per-pool option snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadPoolProperties {
    /// Upper bound on simultaneously running jobs.
    pub core_size: u32,
    /// FIFO queue capacity behind the workers. Zero or negative disables
    /// queueing: submissions only succeed by direct handoff to a free worker.
    pub max_queue_size: i32,
    /// Virtual queue cap checked before offering to the queue, tunable below
    /// `max_queue_size` without recreating the pool.
    pub queue_size_rejection_threshold: u32,
    pub metrics_rolling_stats_window: Duration,
    pub metrics_rolling_stats_buckets: u32,
}

impl Default for ThreadPoolProperties {
    fn default() -> Self {
        Self {
            core_size: 10,
            max_queue_size: -1,
            queue_size_rejection_threshold: 5,
            metrics_rolling_stats_window: Duration::from_millis(10_000),
            metrics_rolling_stats_buckets: 10,
        }
    }
}

impl ThreadPoolProperties {
    pub fn with_core_size(mut self, core_size: u32) -> Self {
        self.core_size = core_size;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: i32) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_queue_size_rejection_threshold(mut self, threshold: u32) -> Self {
        self.queue_size_rejection_threshold = threshold;
        self
    }
}

/// Resolves property snapshots for keys. Implementations may memoize; each
/// snapshot is polled per use by the runtime.
pub trait PropertiesStrategy: Send + Sync + std::fmt::Debug {
    fn command_properties(&self, key: &CommandKey) -> Arc<CommandProperties>;
    fn thread_pool_properties(&self, key: &PoolKey) -> Arc<ThreadPoolProperties>;
}

/// Default strategy: library defaults for every key.
#[derive(Debug, Default)]
pub struct DefaultPropertiesStrategy;

impl PropertiesStrategy for DefaultPropertiesStrategy {
    fn command_properties(&self, _key: &CommandKey) -> Arc<CommandProperties> {
        Arc::new(CommandProperties::default())
    }

    fn thread_pool_properties(&self, _key: &PoolKey) -> Arc<ThreadPoolProperties> {
        Arc::new(ThreadPoolProperties::default())
    }
}
