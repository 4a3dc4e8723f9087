use crate::keys::PoolKey;
use crate::metrics::rolling_number::{RollingNumber, RollingNumberEvent};
use crate::metrics::SharedClock;
use crate::plugins;
use crate::properties::ThreadPoolProperties;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Why a submission was refused. Every variant surfaces to the command
/// runtime as `ThreadPoolRejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolRejection {
    #[error("queue depth is at the admission threshold")]
    QueueThresholdExceeded,
    #[error("queue is full")]
    QueueFull,
    #[error("no idle worker and queueing is disabled")]
    NoIdleWorker,
    #[error("pool is shut down")]
    ShutDown,
}

/// State shared with the dispatcher task and running jobs, so the pool
/// handle itself owns no cycle.
#[derive(Debug)]
struct PoolShared {
    worker_permits: Arc<Semaphore>,
    active: AtomicU32,
    counter: RollingNumber,
}

impl PoolShared {
    fn start_job(
        shared: &Arc<Self>,
        permit: tokio::sync::OwnedSemaphorePermit,
        job: BoxFuture<'static, ()>,
    ) {
        shared
            .counter
            .increment(RollingNumberEvent::ThreadPoolExecuted);
        let running = shared.active.fetch_add(1, Ordering::AcqRel) + 1;
        shared
            .counter
            .update_max(RollingNumberEvent::ThreadPoolMaxActive, running as u64);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            job.await;
            shared.active.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }
}

/// Bounded executor: `core_size` concurrent jobs, an optional FIFO queue
/// with a hard capacity, and a virtual queue cap checked before the offer so
/// operators can tighten admission without recreating the pool.
#[derive(Debug)]
pub struct CommandThreadPool {
    key: PoolKey,
    properties: Arc<ThreadPoolProperties>,
    shared: Arc<PoolShared>,
    queue_tx: Mutex<Option<mpsc::Sender<BoxFuture<'static, ()>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl CommandThreadPool {
    /// Fetch or create the process-wide pool for `key`; the first caller
    /// constructs it with the installed properties strategy.
    pub fn instance(key: &PoolKey, clock: &SharedClock) -> Arc<CommandThreadPool> {
        Self::get_or_create(key, clock, None)
    }

    /// Like [`instance`](Self::instance), but the first caller constructs
    /// the pool with an explicit properties snapshot. An existing pool is
    /// reused unchanged.
    pub fn instance_with_properties(
        key: &PoolKey,
        properties: &Arc<ThreadPoolProperties>,
        clock: &SharedClock,
    ) -> Arc<CommandThreadPool> {
        Self::get_or_create(key, clock, Some(Arc::clone(properties)))
    }

    fn get_or_create(
        key: &PoolKey,
        clock: &SharedClock,
        properties: Option<Arc<ThreadPoolProperties>>,
    ) -> Arc<CommandThreadPool> {
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
        let properties =
            properties.unwrap_or_else(|| plugins::properties_strategy().thread_pool_properties(key));
        let created = Arc::new(CommandThreadPool::new(key.clone(), properties, clock));
        map.insert(key.clone(), Arc::clone(&created));
        drop(map);
        plugins::publisher_for_pool(&created);
        created
    }

    fn new(key: PoolKey, properties: Arc<ThreadPoolProperties>, clock: &SharedClock) -> Self {
        let shared = Arc::new(PoolShared {
            worker_permits: Arc::new(Semaphore::new(properties.core_size.max(1) as usize)),
            active: AtomicU32::new(0),
            counter: RollingNumber::new(
                Arc::clone(clock),
                properties.metrics_rolling_stats_window.as_millis() as u64,
                properties.metrics_rolling_stats_buckets,
            ),
        });

        let mut queue_tx = None;
        let mut dispatcher = None;
        if properties.max_queue_size > 0 {
            if tokio::runtime::Handle::try_current().is_ok() {
                let (tx, rx) = mpsc::channel(properties.max_queue_size as usize);
                dispatcher = Some(tokio::spawn(Self::dispatch(Arc::clone(&shared), rx)));
                queue_tx = Some(tx);
            } else {
                // No runtime to host the dispatcher; degrade to direct handoff.
                warn!(
                    target: "breakwater::pool",
                    pool = %key,
                    "no tokio runtime at pool construction, queueing disabled"
                );
            }
        }

        debug!(
            target: "breakwater::pool",
            pool = %key,
            core_size = properties.core_size,
            max_queue_size = properties.max_queue_size,
            "worker pool created"
        );

        Self {
            key,
            properties,
            shared,
            queue_tx: Mutex::new(queue_tx),
            dispatcher: Mutex::new(dispatcher),
            shutdown: AtomicBool::new(false),
        }
    }

    async fn dispatch(shared: Arc<PoolShared>, mut rx: mpsc::Receiver<BoxFuture<'static, ()>>) {
        loop {
            // Hold a worker permit before taking a job so queued work only
            // leaves the queue when a worker is genuinely free.
            let permit = match Arc::clone(&shared.worker_permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match rx.recv().await {
                Some(job) => PoolShared::start_job(&shared, permit, job),
                None => break,
            }
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Submit a job. Direct handoff to an idle worker wins; otherwise the
    /// job is offered to the queue behind the virtual-cap precheck.
    pub fn submit(&self, job: BoxFuture<'static, ()>) -> Result<(), PoolRejection> {
        if self.shutdown.load(Ordering::Acquire) {
            self.mark_rejected();
            return Err(PoolRejection::ShutDown);
        }
        if let Ok(permit) = Arc::clone(&self.shared.worker_permits).try_acquire_owned() {
            PoolShared::start_job(&self.shared, permit, job);
            return Ok(());
        }

        let tx = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            self.mark_rejected();
            return Err(PoolRejection::NoIdleWorker);
        };
        if self.queue_depth_of(tx) >= self.properties.queue_size_rejection_threshold as usize {
            self.mark_rejected();
            return Err(PoolRejection::QueueThresholdExceeded);
        }
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mark_rejected();
                Err(PoolRejection::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_rejected();
                Err(PoolRejection::ShutDown)
            }
        }
    }

    /// Virtual-cap admission test, exposed for operators and tests. Without
    /// a queue this reports whether a worker is idle.
    pub fn is_queue_space_available(&self) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let tx = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => {
                self.queue_depth_of(tx) < self.properties.queue_size_rejection_threshold as usize
            }
            None => self.shared.worker_permits.available_permits() > 0,
        }
    }

    pub fn active_count(&self) -> u32 {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        let tx = self.queue_tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.as_ref().map_or(0, |tx| self.queue_depth_of(tx))
    }

    pub fn rolling_count_executed(&self) -> u64 {
        self.shared
            .counter
            .rolling_sum(RollingNumberEvent::ThreadPoolExecuted)
    }

    pub fn rolling_count_rejected(&self) -> u64 {
        self.shared
            .counter
            .rolling_sum(RollingNumberEvent::ThreadPoolRejected)
    }

    pub fn rolling_max_active(&self) -> u64 {
        self.shared
            .counter
            .rolling_max(RollingNumberEvent::ThreadPoolMaxActive)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn queue_depth_of(&self, tx: &mpsc::Sender<BoxFuture<'static, ()>>) -> usize {
        tx.max_capacity().saturating_sub(tx.capacity())
    }

    fn mark_rejected(&self) {
        self.shared
            .counter
            .increment(RollingNumberEvent::ThreadPoolRejected);
    }

    /// Stop accepting submissions and abandon queued work. Idempotent.
    pub fn stop(&self) {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        self.queue_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.shared.worker_permits.close();
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        if first {
            debug!(target: "breakwater::pool", pool = %self.key, "worker pool stopped");
        }
    }

    /// Stop accepting submissions, then wait up to `timeout` for running and
    /// queued jobs to drain. Returns true when the pool went idle in time.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + timeout;
        let drained = loop {
            if self.active_count() == 0 && self.queue_depth() == 0 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        self.stop();
        drained
    }
}

type Registry = RwLock<HashMap<PoolKey, Arc<CommandThreadPool>>>;

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| RwLock::new(HashMap::new()));

fn registry() -> &'static Registry {
    &REGISTRY
}

/// Stop every pool immediately and drain the registry.
pub fn shutdown() {
    let pools: Vec<_> = {
        let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
        map.drain().map(|(_, pool)| pool).collect()
    };
    for pool in pools {
        pool.stop();
    }
}

/// Stop every pool, waiting up to `timeout` for each to go idle, then drain
/// the registry. Returns true when every pool drained in time.
pub async fn shutdown_with_timeout(timeout: Duration) -> bool {
    let pools: Vec<_> = {
        let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
        map.drain().map(|(_, pool)| pool).collect()
    };
    let mut all_drained = true;
    for pool in pools {
        all_drained &= pool.stop_with_timeout(timeout).await;
    }
    all_drained
}

/// Every pool currently registered.
pub fn registered_pools() -> Vec<Arc<CommandThreadPool>> {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect()
}
