use super::rolling_number::{RollingNumber, RollingNumberEvent};
use super::rolling_percentile::RollingPercentile;
use super::{EventType, SharedClock};
use crate::keys::{CommandKey, GroupKey};
use crate::plugins;
use crate::properties::CommandProperties;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};

/// Derived view of the rolling window the circuit breaker gates on.
///
/// `ShortCircuited` appears in neither numerator nor denominator: it is an
/// effect of the breaker being open, not a cause. Fallback events never
/// enter health, and a latent success is still a success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    pub total_requests: u64,
    pub error_count: u64,
    pub error_percentage: u64,
}

const SNAPSHOT_NEVER: u64 = u64::MAX;

/// Per-command metrics singleton: rolling event counters, latency
/// percentiles and the concurrent-execution gauge.
#[derive(Debug)]
pub struct CommandMetrics {
    key: CommandKey,
    group: GroupKey,
    properties: Arc<CommandProperties>,
    clock: SharedClock,
    counter: RollingNumber,
    latency: RollingPercentile,
    concurrent_executions: AtomicU32,
    health: Mutex<HealthCounts>,
    health_time: AtomicU64,
}

impl CommandMetrics {
    /// Fetch or create the process-wide metrics object for `key`. The first
    /// caller's properties snapshot wins; racing constructors are discarded.
    pub fn instance(
        key: &CommandKey,
        group: &GroupKey,
        properties: &Arc<CommandProperties>,
        clock: &SharedClock,
    ) -> Arc<CommandMetrics> {
        if let Some(existing) = registry()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Arc::clone(existing);
        }
        let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(key) {
            return Arc::clone(existing);
        }
        let created = Arc::new(CommandMetrics::new(
            key.clone(),
            group.clone(),
            Arc::clone(properties),
            Arc::clone(clock),
        ));
        map.insert(key.clone(), Arc::clone(&created));
        drop(map);
        plugins::publisher_for_command(&created);
        created
    }

    fn new(
        key: CommandKey,
        group: GroupKey,
        properties: Arc<CommandProperties>,
        clock: SharedClock,
    ) -> Self {
        let counter = RollingNumber::new(
            Arc::clone(&clock),
            properties.metrics_rolling_stats_window.as_millis() as u64,
            properties.metrics_rolling_stats_buckets,
        );
        let latency = RollingPercentile::new(
            Arc::clone(&clock),
            properties.metrics_rolling_percentile_window.as_millis() as u64,
            properties.metrics_rolling_percentile_buckets,
            properties.metrics_rolling_percentile_bucket_size,
            properties.metrics_health_snapshot_interval.as_millis() as u64,
            properties.metrics_rolling_percentile_enabled,
        );
        Self {
            key,
            group,
            properties,
            clock,
            counter,
            latency,
            concurrent_executions: AtomicU32::new(0),
            health: Mutex::new(HealthCounts::default()),
            health_time: AtomicU64::new(SNAPSHOT_NEVER),
        }
    }

    pub fn command_key(&self) -> &CommandKey {
        &self.key
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group
    }

    pub fn mark_success(&self, latency_millis: u64) {
        self.mark(EventType::Success);
        self.latency.add_value(latency_millis.min(u32::MAX as u64) as u32);
    }

    pub fn mark_failure(&self, latency_millis: u64) {
        self.mark(EventType::Failure);
        self.latency.add_value(latency_millis.min(u32::MAX as u64) as u32);
    }

    pub fn mark_timeout(&self, latency_millis: u64) {
        self.mark(EventType::Timeout);
        self.latency.add_value(latency_millis.min(u32::MAX as u64) as u32);
    }

    pub fn mark_short_circuited(&self) {
        self.mark(EventType::ShortCircuited);
    }

    pub fn mark_thread_pool_rejection(&self) {
        self.mark(EventType::ThreadPoolRejected);
    }

    pub fn mark_semaphore_rejection(&self) {
        self.mark(EventType::SemaphoreRejected);
    }

    pub fn mark_fallback_success(&self) {
        self.mark(EventType::FallbackSuccess);
    }

    pub fn mark_fallback_failure(&self) {
        self.mark(EventType::FallbackFailure);
    }

    pub fn mark_fallback_rejection(&self) {
        self.mark(EventType::FallbackRejection);
    }

    pub fn mark_exception_thrown(&self) {
        self.mark(EventType::ExceptionThrown);
    }

    pub fn mark_response_from_cache(&self) {
        self.mark(EventType::ResponseFromCache);
    }

    /// Recorded by the collapser when it folds `batch_size` logical requests
    /// into one downstream command.
    pub fn mark_collapsed(&self, batch_size: u64) {
        plugins::event_notifier().mark_event(EventType::Collapsed, &self.key);
        self.counter.add(RollingNumberEvent::Collapsed, batch_size);
    }

    fn mark(&self, event: EventType) {
        plugins::event_notifier().mark_event(event, &self.key);
        self.counter.increment(event.into());
    }

    /// Gauge around user code; feeds the rolling max.
    pub(crate) fn increment_concurrent(&self) {
        let active = self.concurrent_executions.fetch_add(1, Ordering::AcqRel) + 1;
        self.counter
            .update_max(RollingNumberEvent::CommandMaxActive, active as u64);
    }

    pub(crate) fn decrement_concurrent(&self) {
        self.concurrent_executions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current_concurrent_execution_count(&self) -> u32 {
        self.concurrent_executions.load(Ordering::Acquire)
    }

    pub fn rolling_max_concurrent_executions(&self) -> u64 {
        self.counter.rolling_max(RollingNumberEvent::CommandMaxActive)
    }

    pub fn rolling_count(&self, event: EventType) -> u64 {
        self.counter.rolling_sum(event.into())
    }

    pub fn cumulative_count(&self, event: EventType) -> u64 {
        self.counter.cumulative_sum(event.into())
    }

    pub fn execution_time_percentile(&self, p: f64) -> u32 {
        self.latency.percentile(p)
    }

    pub fn execution_time_mean(&self) -> u32 {
        self.latency.mean()
    }

    /// Error rate over the rolling window, cached for
    /// `metrics_health_snapshot_interval`; readers may observe values up to
    /// one interval stale.
    pub fn health_counts(&self) -> HealthCounts {
        let interval = self.properties.metrics_health_snapshot_interval.as_millis() as u64;
        let now = self.clock.now_millis();
        let last = self.health_time.load(Ordering::Acquire);
        let stale = last == SNAPSHOT_NEVER || now.saturating_sub(last) >= interval;
        if stale
            && self
                .health_time
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let fresh = self.compute_health();
            *self.health.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
            return fresh;
        }
        *self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn compute_health(&self) -> HealthCounts {
        let success = self.counter.rolling_sum(RollingNumberEvent::Success);
        let failure = self.counter.rolling_sum(RollingNumberEvent::Failure);
        let timeout = self.counter.rolling_sum(RollingNumberEvent::Timeout);
        let thread_rejected = self.counter.rolling_sum(RollingNumberEvent::ThreadPoolRejected);
        let semaphore_rejected = self
            .counter
            .rolling_sum(RollingNumberEvent::SemaphoreRejected);

        let error_count = failure + timeout + thread_rejected + semaphore_rejected;
        let total_requests = success + error_count;
        let error_percentage = if total_requests > 0 {
            error_count * 100 / total_requests
        } else {
            0
        };
        HealthCounts {
            total_requests,
            error_count,
            error_percentage,
        }
    }

    /// Zero the rolling counters and invalidate the cached health snapshot.
    /// Called when the breaker closes from half-open.
    pub fn reset_counters(&self) {
        self.counter.reset();
        self.health_time.store(SNAPSHOT_NEVER, Ordering::Release);
    }

    pub fn snapshot(&self) -> CommandMetricsSnapshot {
        let mut rolling_counts = HashMap::with_capacity(EventType::COUNT);
        for event in EventType::ALL {
            rolling_counts.insert(event.name(), self.rolling_count(event));
        }
        let health = self.health_counts();
        CommandMetricsSnapshot {
            command: self.key.clone(),
            group: self.group.clone(),
            rolling_counts,
            error_percentage: health.error_percentage,
            total_requests: health.total_requests,
            current_concurrent_executions: self.current_concurrent_execution_count(),
            rolling_max_concurrent_executions: self.rolling_max_concurrent_executions(),
            latency_mean_ms: self.execution_time_mean(),
            latency_p50_ms: self.execution_time_percentile(50.0),
            latency_p90_ms: self.execution_time_percentile(90.0),
            latency_p99_ms: self.execution_time_percentile(99.0),
            timestamp_ms: self.clock.now_millis(),
        }
    }
}

/// Point-in-time consistent view of one command's metrics, for publishers
/// and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CommandMetricsSnapshot {
    pub command: CommandKey,
    pub group: GroupKey,
    pub rolling_counts: HashMap<&'static str, u64>,
    pub error_percentage: u64,
    pub total_requests: u64,
    pub current_concurrent_executions: u32,
    pub rolling_max_concurrent_executions: u64,
    pub latency_mean_ms: u32,
    pub latency_p50_ms: u32,
    pub latency_p90_ms: u32,
    pub latency_p99_ms: u32,
    pub timestamp_ms: u64,
}

type Registry = RwLock<HashMap<CommandKey, Arc<CommandMetrics>>>;

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| RwLock::new(HashMap::new()));

fn registry() -> &'static Registry {
    &REGISTRY
}

/// Every metrics object currently registered.
pub fn all_command_metrics() -> Vec<Arc<CommandMetrics>> {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect()
}

/// Testing hook: drop every registered metrics object.
pub(crate) fn reset_registry() {
    registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
