use super::{EventType, SharedClock};
use std::array;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Counter slots tracked by a [`RollingNumber`]. Superset of the command
/// event taxonomy: gauges rolled up as per-bucket maxima and pool-side
/// counters live here too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollingNumberEvent {
    Success,
    Failure,
    Timeout,
    ShortCircuited,
    ThreadPoolRejected,
    SemaphoreRejected,
    FallbackSuccess,
    FallbackFailure,
    FallbackRejection,
    ExceptionThrown,
    ResponseFromCache,
    Collapsed,
    /// Per-bucket maximum of the concurrent-execution gauge.
    CommandMaxActive,
    /// Per-bucket maximum of a pool's active-job gauge.
    ThreadPoolMaxActive,
    /// Jobs a pool actually started running.
    ThreadPoolExecuted,
}

impl RollingNumberEvent {
    pub const COUNT: usize = 15;

    pub(crate) fn ordinal(self) -> usize {
        match self {
            RollingNumberEvent::Success => 0,
            RollingNumberEvent::Failure => 1,
            RollingNumberEvent::Timeout => 2,
            RollingNumberEvent::ShortCircuited => 3,
            RollingNumberEvent::ThreadPoolRejected => 4,
            RollingNumberEvent::SemaphoreRejected => 5,
            RollingNumberEvent::FallbackSuccess => 6,
            RollingNumberEvent::FallbackFailure => 7,
            RollingNumberEvent::FallbackRejection => 8,
            RollingNumberEvent::ExceptionThrown => 9,
            RollingNumberEvent::ResponseFromCache => 10,
            RollingNumberEvent::Collapsed => 11,
            RollingNumberEvent::CommandMaxActive => 12,
            RollingNumberEvent::ThreadPoolMaxActive => 13,
            RollingNumberEvent::ThreadPoolExecuted => 14,
        }
    }

    /// Max-updater slots accumulate via [`RollingNumber::update_max`], not
    /// increments.
    pub fn is_max_updater(self) -> bool {
        matches!(
            self,
            RollingNumberEvent::CommandMaxActive | RollingNumberEvent::ThreadPoolMaxActive
        )
    }
}

impl From<EventType> for RollingNumberEvent {
    fn from(event: EventType) -> Self {
        match event {
            EventType::Success => RollingNumberEvent::Success,
            EventType::Failure => RollingNumberEvent::Failure,
            EventType::Timeout => RollingNumberEvent::Timeout,
            EventType::ShortCircuited => RollingNumberEvent::ShortCircuited,
            EventType::ThreadPoolRejected => RollingNumberEvent::ThreadPoolRejected,
            EventType::SemaphoreRejected => RollingNumberEvent::SemaphoreRejected,
            EventType::FallbackSuccess => RollingNumberEvent::FallbackSuccess,
            EventType::FallbackFailure => RollingNumberEvent::FallbackFailure,
            EventType::FallbackRejection => RollingNumberEvent::FallbackRejection,
            EventType::ExceptionThrown => RollingNumberEvent::ExceptionThrown,
            EventType::ResponseFromCache => RollingNumberEvent::ResponseFromCache,
            EventType::Collapsed => RollingNumberEvent::Collapsed,
        }
    }
}

/// Bucket start sentinel: never written to, excluded from reads.
const UNUSED: u64 = u64::MAX;

#[derive(Debug)]
struct Bucket {
    window_start: AtomicU64,
    adders: [AtomicU64; RollingNumberEvent::COUNT],
    maxes: [AtomicU64; RollingNumberEvent::COUNT],
}

impl Bucket {
    fn new() -> Self {
        Self {
            window_start: AtomicU64::new(UNUSED),
            adders: array::from_fn(|_| AtomicU64::new(0)),
            maxes: array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn zero(&self) {
        for adder in &self.adders {
            adder.store(0, Ordering::Relaxed);
        }
        for max in &self.maxes {
            max.store(0, Ordering::Relaxed);
        }
    }
}

/// Bucketed event counters over a sliding time window.
///
/// The current bucket is selected by `floor(now / bucket_duration) mod B`;
/// a stale bucket is recycled on first write after its boundary. Concurrent
/// rolls are serialized by a non-blocking try-lock: a writer that loses the
/// race skips the roll and increments whatever bucket is current, which the
/// next successful roller reconciles. Reads are advisory and may observe a
/// bucket mid-rotation.
#[derive(Debug)]
pub struct RollingNumber {
    clock: SharedClock,
    window_millis: u64,
    bucket_millis: u64,
    buckets: Box<[Bucket]>,
    cumulative: [AtomicU64; RollingNumberEvent::COUNT],
    roll_lock: Mutex<()>,
}

impl RollingNumber {
    /// `window` must be an exact multiple of `bucket_count` milliseconds;
    /// uneven divisions are rounded down to the nearest whole bucket.
    pub fn new(clock: SharedClock, window_millis: u64, bucket_count: u32) -> Self {
        let bucket_count = bucket_count.max(1) as usize;
        let bucket_millis = (window_millis / bucket_count as u64).max(1);
        Self {
            clock,
            window_millis: bucket_millis * bucket_count as u64,
            bucket_millis,
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            cumulative: array::from_fn(|_| AtomicU64::new(0)),
            roll_lock: Mutex::new(()),
        }
    }

    pub fn increment(&self, event: RollingNumberEvent) {
        self.add(event, 1);
    }

    pub fn add(&self, event: RollingNumberEvent, n: u64) {
        let bucket = self.current_bucket();
        bucket.adders[event.ordinal()].fetch_add(n, Ordering::Relaxed);
        self.cumulative[event.ordinal()].fetch_add(n, Ordering::Relaxed);
    }

    /// Raise the per-bucket maximum for a max-updater slot.
    pub fn update_max(&self, event: RollingNumberEvent, value: u64) {
        let slot = &self.current_bucket().maxes[event.ordinal()];
        let mut observed = slot.load(Ordering::Relaxed);
        while value > observed {
            match slot.compare_exchange_weak(observed, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
    }

    /// Sum of a counter across all buckets still inside the window.
    pub fn rolling_sum(&self, event: RollingNumberEvent) -> u64 {
        self.live_buckets()
            .map(|bucket| bucket.adders[event.ordinal()].load(Ordering::Relaxed))
            .sum()
    }

    /// Maximum per-bucket value recorded for a max-updater slot across the
    /// window.
    pub fn rolling_max(&self, event: RollingNumberEvent) -> u64 {
        self.live_buckets()
            .map(|bucket| bucket.maxes[event.ordinal()].load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }

    /// Monotonic total since construction; survives [`reset`](Self::reset).
    pub fn cumulative_sum(&self, event: RollingNumberEvent) -> u64 {
        self.cumulative[event.ordinal()].load(Ordering::Relaxed)
    }

    /// Zero every bucket. Used when the breaker closes from half-open so the
    /// old error window cannot re-trip it.
    pub fn reset(&self) {
        let _guard = self.roll_lock.lock().unwrap_or_else(|e| e.into_inner());
        for bucket in self.buckets.iter() {
            bucket.zero();
            bucket.window_start.store(UNUSED, Ordering::Release);
        }
    }

    pub fn window_millis(&self) -> u64 {
        self.window_millis
    }

    fn live_buckets(&self) -> impl Iterator<Item = &Bucket> {
        let now = self.clock.now_millis();
        let window = self.window_millis;
        self.buckets.iter().filter(move |bucket| {
            let start = bucket.window_start.load(Ordering::Acquire);
            start != UNUSED && start <= now && now - start < window
        })
    }

    fn current_bucket(&self) -> &Bucket {
        let now = self.clock.now_millis();
        let expected_start = now - now % self.bucket_millis;
        let index = ((now / self.bucket_millis) as usize) % self.buckets.len();
        let bucket = &self.buckets[index];

        let start = bucket.window_start.load(Ordering::Acquire);
        if start == expected_start {
            return bucket;
        }
        if start != UNUSED && start > expected_start {
            // Clock went backwards: no-op advance, keep writing where we are.
            return bucket;
        }
        if let Ok(_guard) = self.roll_lock.try_lock() {
            // Re-check under the lock; another roller may have won.
            if bucket.window_start.load(Ordering::Acquire) != expected_start {
                debug!(
                    target: "breakwater::metrics",
                    expected_start,
                    "recycling stale rolling bucket"
                );
                bucket.zero();
                bucket.window_start.store(expected_start, Ordering::Release);
            }
        }
        // Losing the try-lock is fine: the write lands in the stale bucket
        // and the next successful roller completes the rotation.
        bucket
    }
}
