//! The command runtime: single-shot execution of one dependency call under
//! cache lookup, breaker admission, isolation, timeout, fallback and event
//! accounting.

pub mod result;

pub use result::CommandResponse;

use crate::circuit::CircuitBreaker;
use crate::context::{LogEntry, RequestContext};
use crate::error::{BadRequest, CommandError, FailureType, RuntimeFailure};
use crate::isolation::semaphore::{execution_semaphore, fallback_semaphore};
use crate::isolation::thread_pool::CommandThreadPool;
use crate::isolation::TrySemaphore;
use crate::keys::{CommandKey, GroupKey, PoolKey};
use crate::metrics::{CommandMetrics, EventType, SharedClock, SystemClock};
use crate::plugins::{self, ExecutionHook};
use crate::properties::{CommandProperties, IsolationStrategy, ThreadPoolProperties};
use futures::future::BoxFuture;
use futures::FutureExt;
use result::{ExecutionState, TIME_NOT_EXECUTED};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;

type BodyFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;
type CacheSlot<T> = watch::Receiver<Option<Arc<CommandResponse<T>>>>;
type CachePublisher<T> = watch::Sender<Option<Arc<CommandResponse<T>>>>;

/// What the worker sends back on the thread path.
type WorkerOutcome<T> = anyhow::Result<T>;

const STATUS_PENDING: u8 = 0;
const STATUS_TIMED_OUT: u8 = 1;
const STATUS_COMPLETED: u8 = 2;

/// Builder for a [`Command`]. A run body is required; everything else has
/// defaults resolved through the installed properties strategy.
pub struct CommandBuilder<T> {
    group: GroupKey,
    key: CommandKey,
    properties: Option<CommandProperties>,
    pool_properties: Option<ThreadPoolProperties>,
    run: Option<BodyFn<T>>,
    fallback: Option<BodyFn<T>>,
    cache_key: Option<String>,
    context: Option<Arc<RequestContext>>,
    hook: Option<Arc<dyn ExecutionHook>>,
    clock: Option<SharedClock>,
}

impl<T: Clone + Send + Sync + 'static> CommandBuilder<T> {
    pub fn new(group: impl Into<GroupKey>, key: impl Into<CommandKey>) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
            properties: None,
            pool_properties: None,
            run: None,
            fallback: None,
            cache_key: None,
            context: None,
            hook: None,
            clock: None,
        }
    }

    /// The dependency call itself.
    pub fn run<F, Fut>(mut self, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.run = Some(Box::new(move || body().boxed()));
        self
    }

    /// Value produced when execution is refused or fails.
    pub fn fallback<F, Fut>(mut self, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || body().boxed()));
        self
    }

    /// Enables per-request memoization under this key.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn properties(mut self, properties: CommandProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Pool configuration used if this command is the one that creates its
    /// pool; existing pools are reused as-is.
    pub fn thread_pool_properties(mut self, properties: ThreadPoolProperties) -> Self {
        self.pool_properties = Some(properties);
        self
    }

    /// Explicit request context; otherwise the ambient current context is
    /// used.
    pub fn context(mut self, context: Arc<RequestContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn ExecutionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Command<T> {
        let CommandBuilder {
            group,
            key,
            properties,
            pool_properties,
            run,
            fallback,
            cache_key,
            context,
            hook,
            clock,
        } = self;

        let properties = match properties {
            Some(properties) => Arc::new(properties),
            None => plugins::properties_strategy().command_properties(&key),
        };
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = CommandMetrics::instance(&key, &group, &properties, &clock);
        let breaker = CircuitBreaker::instance(&key, &properties, &metrics, &clock);
        let pool_key = properties
            .thread_pool_key_override
            .clone()
            .unwrap_or_else(|| group.as_pool_key());
        let execution_semaphore = execution_semaphore(&key);
        let fallback_semaphore = fallback_semaphore(&key);

        Command {
            key,
            group,
            pool_key,
            properties,
            clock,
            metrics,
            breaker,
            execution_semaphore,
            fallback_semaphore,
            hook: hook.unwrap_or_else(plugins::execution_hook),
            run: Mutex::new(run),
            fallback: Mutex::new(fallback),
            cache_key,
            explicit_context: context,
            pool_properties: pool_properties.map(Arc::new),
            started_at_ms: AtomicI64::new(-1),
            status: Arc::new(AtomicU8::new(STATUS_PENDING)),
            state: ExecutionState::new(),
        }
    }
}

/// One single-shot invocation of a dependency call. Construct with
/// [`Command::builder`], run with [`execute`](Command::execute) or
/// [`queue`](Command::queue); a second run attempt fails with
/// [`CommandError::IllegalState`] and touches no metrics.
pub struct Command<T> {
    key: CommandKey,
    group: GroupKey,
    pool_key: PoolKey,
    properties: Arc<CommandProperties>,
    clock: SharedClock,
    metrics: Arc<CommandMetrics>,
    breaker: Arc<CircuitBreaker>,
    execution_semaphore: Arc<TrySemaphore>,
    fallback_semaphore: Arc<TrySemaphore>,
    hook: Arc<dyn ExecutionHook>,
    run: Mutex<Option<BodyFn<T>>>,
    fallback: Mutex<Option<BodyFn<T>>>,
    cache_key: Option<String>,
    explicit_context: Option<Arc<RequestContext>>,
    pool_properties: Option<Arc<ThreadPoolProperties>>,
    /// `-1` until the first (and only) invocation claims the instance.
    started_at_ms: AtomicI64,
    /// Timeout race flag shared with the worker.
    status: Arc<AtomicU8>,
    state: ExecutionState,
}

impl<T: Clone + Send + Sync + 'static> Command<T> {
    pub fn builder(group: impl Into<GroupKey>, key: impl Into<CommandKey>) -> CommandBuilder<T> {
        CommandBuilder::new(group, key)
    }

    /// Run the command to completion and return its value, a fallback value,
    /// or the terminal error.
    pub async fn execute(&self) -> Result<T, CommandError> {
        self.queue().await?.join().await
    }

    /// Start the command and return a future settling to the same result as
    /// [`execute`](Command::execute). Rejections known before submission
    /// (short-circuit, pool rejection) with no fallback value raise from
    /// `queue` itself; a fallback value settles through the returned future.
    pub async fn queue(&self) -> Result<QueuedExecution<'_, T>, CommandError> {
        let now = self.clock.now_millis() as i64;
        if self
            .started_at_ms
            .compare_exchange(-1, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CommandError::IllegalState(
                "command instances are single-shot and this one already executed",
            ));
        }
        if self.run.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return Err(CommandError::IllegalState(
                "command was built without a run body",
            ));
        }

        let context = self.resolve_context();

        // Request cache: serve a hit, or claim the slot for this execution.
        let mut publish: Option<CachePublisher<T>> = None;
        if self.properties.request_cache_enabled {
            if let Some(cache_key) = self.cache_key.clone() {
                let Some(context) = context.clone() else {
                    return Err(CommandError::IllegalState(
                        "request caching requires an active request context",
                    ));
                };
                if let Some(slot) = context.cache().get::<CacheSlot<T>>(&self.key, &cache_key) {
                    return Ok(self.from_cache(slot, Some(context)));
                }
                if self.properties.execution_isolation_strategy == IsolationStrategy::Thread {
                    // Claim the slot with a pending future so duplicate
                    // callers share this execution; the semaphore strategy
                    // instead writes after completion.
                    let (tx, rx) = watch::channel(None);
                    match context.cache().put_if_absent(&self.key, &cache_key, rx) {
                        None => publish = Some(tx),
                        Some(existing) => {
                            return Ok(self.from_cache(existing, Some(context)));
                        }
                    }
                }
            }
        }

        self.hook.on_start(&self.key);

        if !self.breaker.allow_request() {
            debug!(target: "breakwater::command", command = %self.key, "short-circuited");
            self.state.record(EventType::ShortCircuited);
            self.metrics.mark_short_circuited();
            let result = self
                .fallback_or_error(FailureType::ShortCircuit, None)
                .await;
            return self.settle(result, publish, context);
        }

        match self.properties.execution_isolation_strategy {
            IsolationStrategy::Semaphore => {
                let result = self.execute_on_caller(context.as_ref()).await;
                self.settle(result, publish, context)
            }
            IsolationStrategy::Thread => self.submit_to_pool(publish, context).await,
        }
    }

    // ---- semaphore strategy -------------------------------------------------

    async fn execute_on_caller(
        &self,
        context: Option<&Arc<RequestContext>>,
    ) -> Result<T, CommandError> {
        let max = self.properties.execution_semaphore_max_concurrent_requests;
        if !self.execution_semaphore.try_acquire(max) {
            self.state.record(EventType::SemaphoreRejected);
            self.metrics.mark_semaphore_rejection();
            return self
                .fallback_or_error(FailureType::SemaphoreRejected, None)
                .await;
        }

        let result = self.run_inline(context).await;
        self.execution_semaphore.release();
        result
    }

    async fn run_inline(&self, context: Option<&Arc<RequestContext>>) -> Result<T, CommandError> {
        let Some(run) = self.take_run_body() else {
            return Err(CommandError::IllegalState("run body already consumed"));
        };
        self.hook.on_run_start(&self.key);
        self.metrics.increment_concurrent();
        let outcome = run().await;
        self.metrics.decrement_concurrent();

        let latency = self.elapsed_ms();
        let result = self.handle_run_outcome(outcome, latency).await;

        // The semaphore path materializes the value before caching: a
        // concurrent duplicate may have executed too, first write wins.
        if let (Ok(value), Some(context), Some(cache_key), true) = (
            &result,
            context,
            self.cache_key.as_deref(),
            self.properties.request_cache_enabled,
        ) {
            let record = Arc::new(CommandResponse::new(
                Ok(value.clone()),
                self.state.events(),
                latency,
            ));
            let (_tx, rx) = watch::channel(Some(record));
            let _ = context.cache().put_if_absent(&self.key, cache_key, rx);
        }
        result
    }

    // ---- thread strategy ----------------------------------------------------

    async fn submit_to_pool(
        &self,
        publish: Option<CachePublisher<T>>,
        context: Option<Arc<RequestContext>>,
    ) -> Result<QueuedExecution<'_, T>, CommandError> {
        let pool = match &self.pool_properties {
            Some(properties) => {
                CommandThreadPool::instance_with_properties(&self.pool_key, properties, &self.clock)
            }
            None => CommandThreadPool::instance(&self.pool_key, &self.clock),
        };

        let Some(run) = self.take_run_body() else {
            return Err(CommandError::IllegalState("run body already consumed"));
        };

        let (result_tx, result_rx) = oneshot::channel::<WorkerOutcome<T>>();
        let (interrupt_tx, interrupt_rx) = oneshot::channel::<()>();

        let key = self.key.clone();
        let hook = Arc::clone(&self.hook);
        let metrics = Arc::clone(&self.metrics);
        let status = Arc::clone(&self.status);
        let clock = Arc::clone(&self.clock);
        let submitted_at = self.started_at_ms.load(Ordering::Acquire) as u64;
        let timeout_ms = self.properties.execution_timeout.as_millis() as u64;

        let job = async move {
            // Abandoned or stale before it ever ran: exit without touching
            // user code; the caller times out on its own.
            if status.load(Ordering::Acquire) == STATUS_TIMED_OUT {
                return;
            }
            let queued_ms = clock.now_millis().saturating_sub(submitted_at);
            if queued_ms > timeout_ms {
                debug!(
                    target: "breakwater::command",
                    command = %key,
                    queued_ms,
                    "job exceeded its timeout while queued, not running"
                );
                return;
            }

            hook.on_thread_start(&key);
            metrics.increment_concurrent();
            hook.on_run_start(&key);

            let mut run_future = std::pin::pin!(run());
            let mut interrupt_rx = interrupt_rx;
            let outcome = tokio::select! {
                result = &mut run_future => Some(result),
                interrupt = &mut interrupt_rx => {
                    if interrupt.is_ok() {
                        // Caller timed out with interrupt-on-timeout set:
                        // abandon the body.
                        None
                    } else {
                        // Caller went away without interrupting; run to
                        // completion (the result is discarded below if the
                        // timeout already won).
                        Some(run_future.await)
                    }
                }
            };

            metrics.decrement_concurrent();
            hook.on_thread_complete(&key);

            if let Some(result) = outcome {
                let won = status
                    .compare_exchange(
                        STATUS_PENDING,
                        STATUS_COMPLETED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    let _ = result_tx.send(result);
                }
                // A completion after the timeout won the race is discarded:
                // no Success is recorded.
            }
        };
        let job = plugins::concurrency_strategy().wrap(job.boxed());

        match pool.submit(job) {
            Ok(()) => Ok(QueuedExecution {
                command: self,
                context,
                mode: Mode::Pending {
                    result_rx,
                    interrupt: Some(interrupt_tx),
                    publish,
                },
            }),
            Err(rejection) => {
                debug!(
                    target: "breakwater::command",
                    command = %self.key,
                    pool = %self.pool_key,
                    %rejection,
                    "worker pool rejected submission"
                );
                self.state.record(EventType::ThreadPoolRejected);
                self.metrics.mark_thread_pool_rejection();
                let result = self
                    .fallback_or_error(FailureType::ThreadPoolRejected, None)
                    .await;
                self.settle(result, publish, context)
            }
        }
    }

    // ---- shared paths -------------------------------------------------------

    /// Success/bad-request/failure classification once the run body has
    /// produced an outcome.
    async fn handle_run_outcome(
        &self,
        outcome: anyhow::Result<T>,
        latency: i64,
    ) -> Result<T, CommandError> {
        self.state.set_execution_time(latency);
        match outcome {
            Ok(value) => {
                self.state.record(EventType::Success);
                self.metrics.mark_success(latency.max(0) as u64);
                self.breaker.mark_success();
                self.hook.on_run_success(&self.key);
                self.hook.on_complete(&self.key);
                Ok(value)
            }
            Err(error) if error.is::<BadRequest>() => {
                // User-signalled invalid input: no failure accounting, no
                // fallback, no breaker involvement.
                self.hook.on_run_error(&self.key, &error);
                Err(CommandError::BadRequest(Arc::new(error)))
            }
            Err(error) => {
                self.state.record(EventType::Failure);
                self.metrics.mark_failure(latency.max(0) as u64);
                self.hook.on_run_error(&self.key, &error);
                self.fallback_or_error(FailureType::CommandFailure, Some(error))
                    .await
            }
        }
    }

    /// Step 9: produce a fallback value or surface the terminal failure.
    /// The originating event has already been recorded by the caller.
    async fn fallback_or_error(
        &self,
        failure_type: FailureType,
        cause: Option<anyhow::Error>,
    ) -> Result<T, CommandError> {
        if !self.properties.fallback_enabled {
            return self.fail(failure_type, "fallback disabled", cause, None);
        }

        let max = self.properties.fallback_semaphore_max_concurrent_requests;
        if !self.fallback_semaphore.try_acquire(max) {
            self.state.record(EventType::FallbackRejection);
            self.state.record(EventType::FallbackFailure);
            self.metrics.mark_fallback_rejection();
            return self.fail(
                FailureType::FallbackSemaphoreRejected,
                "fallback semaphore at capacity",
                cause,
                None,
            );
        }

        let result = match self.take_fallback_body() {
            None => {
                self.state.record(EventType::FallbackFailure);
                self.metrics.mark_fallback_failure();
                self.fail(failure_type, "no fallback available", cause, None)
            }
            Some(fallback) => {
                self.hook.on_fallback_start(&self.key);
                match fallback().await {
                    Ok(value) => {
                        self.state.record(EventType::FallbackSuccess);
                        self.metrics.mark_fallback_success();
                        self.hook.on_fallback_success(&self.key);
                        self.hook.on_complete(&self.key);
                        Ok(value)
                    }
                    Err(fallback_error) => {
                        self.state.record(EventType::FallbackFailure);
                        self.metrics.mark_fallback_failure();
                        self.hook.on_fallback_error(&self.key, &fallback_error);
                        self.fail(
                            failure_type,
                            "run and fallback both failed",
                            cause,
                            Some(fallback_error),
                        )
                    }
                }
            }
        };
        self.fallback_semaphore.release();
        result
    }

    /// Every surfaced `RuntimeFailure` counts one `ExceptionThrown`.
    fn fail(
        &self,
        failure_type: FailureType,
        message: &str,
        cause: Option<anyhow::Error>,
        fallback_cause: Option<anyhow::Error>,
    ) -> Result<T, CommandError> {
        self.state.record(EventType::ExceptionThrown);
        self.metrics.mark_exception_thrown();
        self.hook.on_error(&self.key, failure_type);
        let mut failure = RuntimeFailure::new(self.key.clone(), failure_type, message);
        if let Some(cause) = cause {
            failure = failure.with_cause(cause);
        }
        if let Some(fallback_cause) = fallback_cause {
            failure = failure.with_fallback_cause(fallback_cause);
        }
        Err(CommandError::Runtime(failure))
    }

    /// Wrap an already-final result: publish, notify, log, and either hand
    /// back a settled future or raise.
    fn settle(
        &self,
        result: Result<T, CommandError>,
        publish: Option<CachePublisher<T>>,
        context: Option<Arc<RequestContext>>,
    ) -> Result<QueuedExecution<'_, T>, CommandError> {
        self.complete(&result, publish, context.as_ref());
        match result {
            Ok(value) => Ok(QueuedExecution {
                command: self,
                context,
                mode: Mode::Settled(value),
            }),
            Err(error) => Err(error),
        }
    }

    /// Terminal bookkeeping, exactly once per invocation: cache publication,
    /// execution notification and the request-log append.
    fn complete(
        &self,
        result: &Result<T, CommandError>,
        publish: Option<CachePublisher<T>>,
        context: Option<&Arc<RequestContext>>,
    ) {
        let events = self.state.events();
        let time = self.state.execution_time_ms();

        if let Some(tx) = publish {
            let record = Arc::new(CommandResponse::new(result.clone(), events.clone(), time));
            let _ = tx.send(Some(record));
        }

        plugins::event_notifier().mark_command_execution(
            &self.key,
            self.properties.execution_isolation_strategy,
            time,
            &events,
        );

        if self.properties.request_log_enabled {
            if let Some(context) = context {
                context.log().record(LogEntry {
                    command: self.key.clone(),
                    events,
                    execution_time_ms: time,
                });
            }
        }
    }

    fn from_cache(
        &self,
        slot: CacheSlot<T>,
        context: Option<Arc<RequestContext>>,
    ) -> QueuedExecution<'_, T> {
        self.state.record(EventType::ResponseFromCache);
        self.metrics.mark_response_from_cache();
        QueuedExecution {
            command: self,
            context,
            mode: Mode::Cached { slot },
        }
    }

    async fn finish_from_cache(
        &self,
        mut slot: CacheSlot<T>,
        context: Option<&Arc<RequestContext>>,
    ) -> Result<T, CommandError> {
        let record = match slot.wait_for(|value| value.is_some()).await {
            Ok(value) => match value.as_ref() {
                Some(record) => Arc::clone(record),
                None => {
                    return self.abandoned_cache_entry(context);
                }
            },
            Err(_) => return self.abandoned_cache_entry(context),
        };

        // Immutable record plus this consumer's own view: original events
        // first, ResponseFromCache appended, execution time pinned at -1.
        self.state.prepend(record.events());
        self.state.set_execution_time(TIME_NOT_EXECUTED);
        let result = record.outcome().clone();
        self.complete(&result, None, context);
        result
    }

    fn abandoned_cache_entry(
        &self,
        context: Option<&Arc<RequestContext>>,
    ) -> Result<T, CommandError> {
        let result = self.fail(
            FailureType::CommandFailure,
            "cached execution was abandoned before completing",
            None,
            None,
        );
        self.complete(&result, None, context);
        result
    }

    fn resolve_context(&self) -> Option<Arc<RequestContext>> {
        self.explicit_context
            .clone()
            .or_else(RequestContext::current)
    }

    fn take_run_body(&self) -> Option<BodyFn<T>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn take_fallback_body(&self) -> Option<BodyFn<T>> {
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn elapsed_ms(&self) -> i64 {
        let started = self.started_at_ms.load(Ordering::Acquire);
        if started < 0 {
            return TIME_NOT_EXECUTED;
        }
        self.clock.now_millis() as i64 - started
    }

    // ---- response introspection --------------------------------------------

    pub fn command_key(&self) -> &CommandKey {
        &self.key
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    pub fn metrics(&self) -> &Arc<CommandMetrics> {
        &self.metrics
    }

    /// Events recorded for this invocation, in insertion order.
    pub fn execution_events(&self) -> Vec<EventType> {
        self.state.events()
    }

    /// Wall time of the actual execution; `-1` when the response came from
    /// the cache or the body never ran.
    pub fn execution_time_ms(&self) -> i64 {
        self.state.execution_time_ms()
    }

    pub fn is_executed(&self) -> bool {
        self.started_at_ms.load(Ordering::Acquire) >= 0
    }

    pub fn is_successful_execution(&self) -> bool {
        self.state.contains(EventType::Success)
    }

    pub fn is_failed_execution(&self) -> bool {
        self.state.contains(EventType::Failure)
    }

    pub fn is_response_from_fallback(&self) -> bool {
        self.state.contains(EventType::FallbackSuccess)
    }

    pub fn is_response_timed_out(&self) -> bool {
        self.state.contains(EventType::Timeout)
    }

    pub fn is_response_rejected(&self) -> bool {
        self.state.contains(EventType::ThreadPoolRejected)
            || self.state.contains(EventType::SemaphoreRejected)
    }

    pub fn is_response_short_circuited(&self) -> bool {
        self.state.contains(EventType::ShortCircuited)
    }

    pub fn is_response_from_cache(&self) -> bool {
        self.state.contains(EventType::ResponseFromCache)
    }

    pub fn is_circuit_breaker_open(&self) -> bool {
        self.breaker.is_open()
    }
}

enum Mode<T: Clone> {
    /// Outcome fully known at `queue` time.
    Settled(T),
    /// Live worker execution; the timeout race plays out in `join`.
    Pending {
        result_rx: oneshot::Receiver<WorkerOutcome<T>>,
        interrupt: Option<oneshot::Sender<()>>,
        publish: Option<CachePublisher<T>>,
    },
    /// Another invocation in this request owns the execution.
    Cached { slot: CacheSlot<T> },
}

/// Future-like handle returned by [`Command::queue`]. Awaiting
/// [`join`](QueuedExecution::join) applies the command timeout and yields
/// the same result `execute` would.
pub struct QueuedExecution<'a, T: Clone + Send + Sync + 'static> {
    command: &'a Command<T>,
    context: Option<Arc<RequestContext>>,
    mode: Mode<T>,
}

impl<'a, T: Clone + Send + Sync + 'static> QueuedExecution<'a, T> {
    pub async fn join(self) -> Result<T, CommandError> {
        let command = self.command;
        match self.mode {
            Mode::Settled(value) => Ok(value),
            Mode::Cached { slot } => command.finish_from_cache(slot, self.context.as_ref()).await,
            Mode::Pending {
                mut result_rx,
                interrupt,
                publish,
            } => {
                let result = command
                    .await_worker(&mut result_rx, interrupt)
                    .await;
                command.complete(&result, publish, self.context.as_ref());
                result
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Command<T> {
    /// Caller side of the thread strategy: wait for the worker with the
    /// remaining execution timeout and resolve the race.
    async fn await_worker(
        &self,
        result_rx: &mut oneshot::Receiver<WorkerOutcome<T>>,
        interrupt: Option<oneshot::Sender<()>>,
    ) -> Result<T, CommandError> {
        let timeout = self.properties.execution_timeout;
        let elapsed = Duration::from_millis(self.elapsed_ms().max(0) as u64);
        let remaining = timeout.saturating_sub(elapsed);

        match tokio::time::timeout(remaining, &mut *result_rx).await {
            Ok(Ok(outcome)) => {
                let latency = self.elapsed_ms();
                self.handle_run_outcome(outcome, latency).await
            }
            Ok(Err(_sender_dropped)) => self.worker_abandoned(interrupt).await,
            Err(_elapsed) => {
                let won = self
                    .status
                    .compare_exchange(
                        STATUS_PENDING,
                        STATUS_TIMED_OUT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    if self.properties.execution_interrupt_on_timeout {
                        if let Some(interrupt) = interrupt {
                            let _ = interrupt.send(());
                        }
                    }
                    self.timed_out().await
                } else {
                    // The worker committed a result between the timer firing
                    // and our claim; take it.
                    match result_rx.await {
                        Ok(outcome) => {
                            let latency = self.elapsed_ms();
                            self.handle_run_outcome(outcome, latency).await
                        }
                        Err(_) => self.worker_abandoned(None).await,
                    }
                }
            }
        }
    }

    async fn timed_out(&self) -> Result<T, CommandError> {
        let latency = self.elapsed_ms();
        self.state.set_execution_time(latency);
        self.state.record(EventType::Timeout);
        self.metrics.mark_timeout(latency.max(0) as u64);
        self.fallback_or_error(FailureType::Timeout, None).await
    }

    /// The worker went away without producing a result: it skipped a stale
    /// job, the pool shut down mid-flight, or the body panicked.
    async fn worker_abandoned(
        &self,
        _interrupt: Option<oneshot::Sender<()>>,
    ) -> Result<T, CommandError> {
        let timeout_ms = self.properties.execution_timeout.as_millis() as i64;
        if self.elapsed_ms() >= timeout_ms {
            let _ = self.status.compare_exchange(
                STATUS_PENDING,
                STATUS_TIMED_OUT,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return self.timed_out().await;
        }
        let latency = self.elapsed_ms();
        self.state.set_execution_time(latency);
        self.state.record(EventType::Failure);
        self.metrics.mark_failure(latency.max(0) as u64);
        self.fallback_or_error(
            FailureType::CommandFailure,
            Some(anyhow::anyhow!("worker abandoned the execution")),
        )
        .await
    }
}
