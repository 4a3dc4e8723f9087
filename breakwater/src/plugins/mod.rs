//! Collaborator ports and their process-wide registration points. Every
//! port ships a no-op default; installing an implementation before the
//! first command runs makes it visible to all registries.

use crate::isolation::CommandThreadPool;
use crate::keys::{CommandKey, GroupKey};
use crate::metrics::{CommandMetrics, EventType};
use crate::properties::{
    DefaultPropertiesStrategy, IsolationStrategy, PropertiesStrategy,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use tracing::warn;

/// Receives every metric event as it is marked, plus a completion record per
/// command execution.
pub trait EventNotifier: Send + Sync + std::fmt::Debug {
    fn mark_event(&self, _event: EventType, _command: &CommandKey) {}

    fn mark_command_execution(
        &self,
        _command: &CommandKey,
        _isolation: IsolationStrategy,
        _latency_ms: i64,
        _events: &[EventType],
    ) {
    }
}

#[derive(Debug, Default)]
pub struct DefaultEventNotifier;

impl EventNotifier for DefaultEventNotifier {}

/// Notifier forwarding events to the `metrics` facade, for services that
/// already ship a recorder (Prometheus, statsd, ...).
#[derive(Debug, Default)]
pub struct TelemetryEventNotifier;

impl EventNotifier for TelemetryEventNotifier {
    fn mark_event(&self, event: EventType, command: &CommandKey) {
        metrics::increment_counter!(
            "breakwater_command_events_total",
            "command" => command.name().to_string(),
            "event" => event.name()
        );
    }

    fn mark_command_execution(
        &self,
        command: &CommandKey,
        isolation: IsolationStrategy,
        latency_ms: i64,
        _events: &[EventType],
    ) {
        if latency_ms >= 0 {
            metrics::histogram!(
                "breakwater_command_latency_ms",
                latency_ms as f64,
                "command" => command.name().to_string(),
                "isolation" => match isolation {
                    IsolationStrategy::Thread => "thread",
                    IsolationStrategy::Semaphore => "semaphore",
                }
            );
        }
    }
}

/// Lifecycle callbacks around one command execution. Callbacks are only
/// invoked for gates the execution actually reached; they must be cheap and
/// must not block.
pub trait ExecutionHook: Send + Sync {
    fn on_start(&self, _command: &CommandKey) {}
    fn on_complete(&self, _command: &CommandKey) {}
    fn on_run_start(&self, _command: &CommandKey) {}
    fn on_run_success(&self, _command: &CommandKey) {}
    fn on_run_error(&self, _command: &CommandKey, _error: &anyhow::Error) {}
    fn on_fallback_start(&self, _command: &CommandKey) {}
    fn on_fallback_success(&self, _command: &CommandKey) {}
    fn on_fallback_error(&self, _command: &CommandKey, _error: &anyhow::Error) {}
    fn on_error(&self, _command: &CommandKey, _failure_type: crate::error::FailureType) {}
    fn on_thread_start(&self, _command: &CommandKey) {}
    fn on_thread_complete(&self, _command: &CommandKey) {}
}

#[derive(Debug, Default)]
pub struct DefaultExecutionHook;

impl ExecutionHook for DefaultExecutionHook {}

/// Decorates jobs handed to the worker pool so caller state survives the
/// hop onto a pool task: capture on submit, restore on dispatch.
pub trait ConcurrencyStrategy: Send + Sync + std::fmt::Debug {
    fn wrap(&self, job: BoxFuture<'static, ()>) -> BoxFuture<'static, ()>;
}

/// Default strategy: re-install the caller's request context around the job.
#[derive(Debug, Default)]
pub struct DefaultConcurrencyStrategy;

impl ConcurrencyStrategy for DefaultConcurrencyStrategy {
    fn wrap(&self, job: BoxFuture<'static, ()>) -> BoxFuture<'static, ()> {
        match crate::context::RequestContext::current() {
            Some(context) => context.scope(job).boxed(),
            None => job,
        }
    }
}

/// A live publisher created by a [`MetricsPublisher`] factory. Kept alive
/// for the life of the process; `initialize` is called exactly once, right
/// after creation.
pub trait PublisherHandle: Send + Sync {
    fn initialize(&self) {}
}

struct NoOpPublisherHandle;

impl PublisherHandle for NoOpPublisherHandle {}

/// Factory for per-command, per-pool and per-group publishers.
pub trait MetricsPublisher: Send + Sync + std::fmt::Debug {
    fn create_command_publisher(
        &self,
        _metrics: &Arc<CommandMetrics>,
    ) -> Box<dyn PublisherHandle> {
        Box::new(NoOpPublisherHandle)
    }

    fn create_pool_publisher(&self, _pool: &Arc<CommandThreadPool>) -> Box<dyn PublisherHandle> {
        Box::new(NoOpPublisherHandle)
    }

    fn create_group_publisher(&self, _group: &GroupKey) -> Box<dyn PublisherHandle> {
        Box::new(NoOpPublisherHandle)
    }
}

#[derive(Debug, Default)]
pub struct DefaultMetricsPublisher;

impl MetricsPublisher for DefaultMetricsPublisher {}

static EVENT_NOTIFIER: LazyLock<RwLock<Arc<dyn EventNotifier>>> =
    LazyLock::new(|| RwLock::new(Arc::new(DefaultEventNotifier)));
static EXECUTION_HOOK: LazyLock<RwLock<Arc<dyn ExecutionHook>>> =
    LazyLock::new(|| RwLock::new(Arc::new(DefaultExecutionHook)));
static CONCURRENCY_STRATEGY: LazyLock<RwLock<Arc<dyn ConcurrencyStrategy>>> =
    LazyLock::new(|| RwLock::new(Arc::new(DefaultConcurrencyStrategy)));
static METRICS_PUBLISHER: LazyLock<RwLock<Arc<dyn MetricsPublisher>>> =
    LazyLock::new(|| RwLock::new(Arc::new(DefaultMetricsPublisher)));
static PROPERTIES_STRATEGY: LazyLock<RwLock<Arc<dyn PropertiesStrategy>>> =
    LazyLock::new(|| RwLock::new(Arc::new(DefaultPropertiesStrategy)));

/// Live publisher handles plus the groups already published, so each
/// `initialize` runs exactly once.
static PUBLISHER_STATE: LazyLock<Mutex<PublisherState>> =
    LazyLock::new(|| Mutex::new(PublisherState::default()));

#[derive(Default)]
struct PublisherState {
    handles: Vec<Box<dyn PublisherHandle>>,
    groups: HashSet<GroupKey>,
}

pub fn event_notifier() -> Arc<dyn EventNotifier> {
    Arc::clone(&EVENT_NOTIFIER.read().unwrap_or_else(|e| e.into_inner()))
}

pub fn register_event_notifier(notifier: Arc<dyn EventNotifier>) {
    *EVENT_NOTIFIER.write().unwrap_or_else(|e| e.into_inner()) = notifier;
}

pub fn execution_hook() -> Arc<dyn ExecutionHook> {
    Arc::clone(&EXECUTION_HOOK.read().unwrap_or_else(|e| e.into_inner()))
}

pub fn register_execution_hook(hook: Arc<dyn ExecutionHook>) {
    *EXECUTION_HOOK.write().unwrap_or_else(|e| e.into_inner()) = hook;
}

pub fn concurrency_strategy() -> Arc<dyn ConcurrencyStrategy> {
    Arc::clone(
        &CONCURRENCY_STRATEGY
            .read()
            .unwrap_or_else(|e| e.into_inner()),
    )
}

pub fn register_concurrency_strategy(strategy: Arc<dyn ConcurrencyStrategy>) {
    *CONCURRENCY_STRATEGY
        .write()
        .unwrap_or_else(|e| e.into_inner()) = strategy;
}

pub fn metrics_publisher() -> Arc<dyn MetricsPublisher> {
    Arc::clone(&METRICS_PUBLISHER.read().unwrap_or_else(|e| e.into_inner()))
}

pub fn register_metrics_publisher(publisher: Arc<dyn MetricsPublisher>) {
    *METRICS_PUBLISHER.write().unwrap_or_else(|e| e.into_inner()) = publisher;
}

pub fn properties_strategy() -> Arc<dyn PropertiesStrategy> {
    Arc::clone(
        &PROPERTIES_STRATEGY
            .read()
            .unwrap_or_else(|e| e.into_inner()),
    )
}

pub fn register_properties_strategy(strategy: Arc<dyn PropertiesStrategy>) {
    *PROPERTIES_STRATEGY
        .write()
        .unwrap_or_else(|e| e.into_inner()) = strategy;
}

/// Create and initialize the publisher for a freshly registered command
/// metrics object, plus its group publisher on first sight of the group.
pub(crate) fn publisher_for_command(metrics: &Arc<CommandMetrics>) {
    let publisher = metrics_publisher();
    let mut state = PUBLISHER_STATE.lock().unwrap_or_else(|e| e.into_inner());
    let handle = publisher.create_command_publisher(metrics);
    initialize_handle(handle.as_ref());
    state.handles.push(handle);
    if state.groups.insert(metrics.group_key().clone()) {
        let handle = publisher.create_group_publisher(metrics.group_key());
        initialize_handle(handle.as_ref());
        state.handles.push(handle);
    }
}

/// Create and initialize the publisher for a freshly registered pool.
pub(crate) fn publisher_for_pool(pool: &Arc<CommandThreadPool>) {
    let publisher = metrics_publisher();
    let mut state = PUBLISHER_STATE.lock().unwrap_or_else(|e| e.into_inner());
    let handle = publisher.create_pool_publisher(pool);
    initialize_handle(handle.as_ref());
    state.handles.push(handle);
}

/// Publisher faults must never take an execution down with them.
fn initialize_handle(handle: &dyn PublisherHandle) {
    if catch_unwind(AssertUnwindSafe(|| handle.initialize())).is_err() {
        warn!(target: "breakwater::plugins", "metrics publisher initialization panicked, suppressed");
    }
}

/// Testing hook: drop publisher handles and group markers.
pub(crate) fn reset_publisher_state() {
    let mut state = PUBLISHER_STATE.lock().unwrap_or_else(|e| e.into_inner());
    state.handles.clear();
    state.groups.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults_are_installed() {
        let notifier = event_notifier();
        notifier.mark_event(EventType::Success, &CommandKey::new("NoOp"));
        let strategy = properties_strategy();
        let props = strategy.command_properties(&CommandKey::new("NoOp"));
        assert!(props.circuit_breaker_enabled);
    }

    #[test]
    fn telemetry_notifier_is_callable_without_a_recorder() {
        let notifier = TelemetryEventNotifier;
        let key = CommandKey::new("TelemetryProbe");
        notifier.mark_event(EventType::Failure, &key);
        notifier.mark_command_execution(
            &key,
            IsolationStrategy::Thread,
            5,
            &[EventType::Failure, EventType::FallbackSuccess],
        );
        // Cached responses report -1; the histogram must skip them.
        notifier.mark_command_execution(
            &key,
            IsolationStrategy::Semaphore,
            -1,
            &[EventType::ResponseFromCache],
        );
    }

    #[test]
    fn publisher_initialize_panic_is_suppressed() {
        struct Panicky;
        impl PublisherHandle for Panicky {
            fn initialize(&self) {
                panic!("boom");
            }
        }
        initialize_handle(&Panicky);
    }

    #[tokio::test]
    async fn default_concurrency_strategy_restores_context() {
        use crate::context::RequestContext;

        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let context = RequestContext::new();
        let job = context
            .scope(async {
                concurrency_strategy().wrap(Box::pin(async {
                    if RequestContext::current().is_some() {
                        SEEN.store(1, Ordering::SeqCst);
                    }
                }))
            })
            .await;
        // The job runs on a detached task; the wrapper must carry the
        // context across.
        tokio::spawn(job).await.unwrap();
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);
    }
}
