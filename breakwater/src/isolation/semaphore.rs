use crate::keys::CommandKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

/// Counting permit with non-blocking acquire. No fairness, no queueing, no
/// blocking; the limit is passed in on each acquire so it can be tuned
/// without replacing the semaphore.
#[derive(Debug, Default)]
pub struct TrySemaphore {
    in_use: AtomicU32,
}

impl TrySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a permit was taken (`in_use < max` held atomically).
    pub fn try_acquire(&self, max: u32) -> bool {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Acquire)
    }
}

type SemaphoreMap = RwLock<HashMap<CommandKey, Arc<TrySemaphore>>>;

static EXECUTION: LazyLock<SemaphoreMap> = LazyLock::new(|| RwLock::new(HashMap::new()));
static FALLBACK: LazyLock<SemaphoreMap> = LazyLock::new(|| RwLock::new(HashMap::new()));

fn get_or_create(map: &SemaphoreMap, key: &CommandKey) -> Arc<TrySemaphore> {
    if let Some(existing) = map.read().unwrap_or_else(|e| e.into_inner()).get(key) {
        return Arc::clone(existing);
    }
    let mut write = map.write().unwrap_or_else(|e| e.into_inner());
    Arc::clone(
        write
            .entry(key.clone())
            .or_insert_with(|| Arc::new(TrySemaphore::new())),
    )
}

/// Process-wide execution permit for one command class (semaphore strategy).
pub fn execution_semaphore(key: &CommandKey) -> Arc<TrySemaphore> {
    get_or_create(&EXECUTION, key)
}

/// Process-wide fallback permit for one command class.
pub fn fallback_semaphore(key: &CommandKey) -> Arc<TrySemaphore> {
    get_or_create(&FALLBACK, key)
}

/// Testing hook: drop every registered semaphore.
pub(crate) fn reset_registry() {
    EXECUTION.write().unwrap_or_else(|e| e.into_inner()).clear();
    FALLBACK.write().unwrap_or_else(|e| e.into_inner()).clear();
}
