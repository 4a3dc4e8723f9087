use super::SharedClock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

const UNUSED: u64 = u64::MAX;

#[derive(Debug)]
struct PercentileBucket {
    window_start: AtomicU64,
    /// Bounded reservoir; once full, new samples overwrite round-robin.
    samples: Mutex<Vec<u32>>,
    insert_index: AtomicUsize,
}

impl PercentileBucket {
    fn new(capacity: usize) -> Self {
        Self {
            window_start: AtomicU64::new(UNUSED),
            samples: Mutex::new(Vec::with_capacity(capacity)),
            insert_index: AtomicUsize::new(0),
        }
    }

    fn zero(&self) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.insert_index.store(0, Ordering::Relaxed);
    }
}

/// Sorted aggregate of all live latency samples, recomputed at most once per
/// snapshot interval.
#[derive(Debug, Clone, Default)]
struct PercentileSnapshot {
    sorted: Vec<u32>,
    mean: u32,
}

impl PercentileSnapshot {
    fn from_samples(mut samples: Vec<u32>) -> Self {
        samples.sort_unstable();
        let mean = if samples.is_empty() {
            0
        } else {
            (samples.iter().map(|&v| v as u64).sum::<u64>() / samples.len() as u64) as u32
        };
        Self {
            sorted: samples,
            mean,
        }
    }

    fn percentile(&self, p: f64) -> u32 {
        if self.sorted.is_empty() {
            return 0;
        }
        let p = p.clamp(0.0, 100.0);
        let rank = (p / 100.0 * (self.sorted.len() - 1) as f64).round() as usize;
        self.sorted[rank]
    }
}

/// Latency reservoirs with the same ring rotation rules as
/// [`RollingNumber`](super::RollingNumber); percentile queries recompute on
/// demand and cache the result for the configured interval.
#[derive(Debug)]
pub struct RollingPercentile {
    clock: SharedClock,
    window_millis: u64,
    bucket_millis: u64,
    bucket_capacity: usize,
    enabled: bool,
    buckets: Box<[PercentileBucket]>,
    roll_lock: Mutex<()>,
    snapshot: RwLock<PercentileSnapshot>,
    snapshot_time: AtomicU64,
    snapshot_interval_millis: u64,
}

impl RollingPercentile {
    pub fn new(
        clock: SharedClock,
        window_millis: u64,
        bucket_count: u32,
        bucket_capacity: usize,
        snapshot_interval_millis: u64,
        enabled: bool,
    ) -> Self {
        let bucket_count = bucket_count.max(1) as usize;
        let bucket_millis = (window_millis / bucket_count as u64).max(1);
        Self {
            clock,
            window_millis: bucket_millis * bucket_count as u64,
            bucket_millis,
            bucket_capacity,
            enabled,
            buckets: (0..bucket_count)
                .map(|_| PercentileBucket::new(bucket_capacity))
                .collect(),
            roll_lock: Mutex::new(()),
            snapshot: RwLock::new(PercentileSnapshot::default()),
            snapshot_time: AtomicU64::new(UNUSED),
            snapshot_interval_millis,
        }
    }

    pub fn add_value(&self, latency_millis: u32) {
        if !self.enabled {
            return;
        }
        let bucket = self.current_bucket();
        let mut samples = bucket.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() < self.bucket_capacity {
            samples.push(latency_millis);
        } else if self.bucket_capacity > 0 {
            let index = bucket.insert_index.fetch_add(1, Ordering::Relaxed);
            samples[index % self.bucket_capacity] = latency_millis;
        }
    }

    /// Latency at percentile `p` (0–100) over the trailing window.
    pub fn percentile(&self, p: f64) -> u32 {
        if !self.enabled {
            return 0;
        }
        self.refresh_snapshot();
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .percentile(p)
    }

    pub fn mean(&self) -> u32 {
        if !self.enabled {
            return 0;
        }
        self.refresh_snapshot();
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).mean
    }

    pub fn reset(&self) {
        let _guard = self.roll_lock.lock().unwrap_or_else(|e| e.into_inner());
        for bucket in self.buckets.iter() {
            bucket.zero();
            bucket.window_start.store(UNUSED, Ordering::Release);
        }
        self.snapshot_time.store(UNUSED, Ordering::Release);
    }

    fn refresh_snapshot(&self) {
        let now = self.clock.now_millis();
        let last = self.snapshot_time.load(Ordering::Acquire);
        let stale = last == UNUSED || now.saturating_sub(last) >= self.snapshot_interval_millis;
        if !stale {
            return;
        }
        if self
            .snapshot_time
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another reader is recomputing; serve whatever is cached.
            return;
        }
        let mut collected = Vec::new();
        for bucket in self.live_buckets(now) {
            let samples = bucket.samples.lock().unwrap_or_else(|e| e.into_inner());
            collected.extend_from_slice(&samples);
        }
        let fresh = PercentileSnapshot::from_samples(collected);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = fresh;
    }

    fn live_buckets(&self, now: u64) -> impl Iterator<Item = &PercentileBucket> {
        let window = self.window_millis;
        self.buckets.iter().filter(move |bucket| {
            let start = bucket.window_start.load(Ordering::Acquire);
            start != UNUSED && start <= now && now - start < window
        })
    }

    fn current_bucket(&self) -> &PercentileBucket {
        let now = self.clock.now_millis();
        let expected_start = now - now % self.bucket_millis;
        let index = ((now / self.bucket_millis) as usize) % self.buckets.len();
        let bucket = &self.buckets[index];

        let start = bucket.window_start.load(Ordering::Acquire);
        if start == expected_start {
            return bucket;
        }
        if start != UNUSED && start > expected_start {
            return bucket;
        }
        if let Ok(_guard) = self.roll_lock.try_lock() {
            if bucket.window_start.load(Ordering::Acquire) != expected_start {
                bucket.zero();
                bucket.window_start.store(expected_start, Ordering::Release);
            }
        }
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ManualClock;
    use std::sync::Arc;

    fn fixture() -> (Arc<ManualClock>, RollingPercentile) {
        let clock = Arc::new(ManualClock::default());
        // Snapshot interval 0: recompute on every read for determinism.
        let percentile = RollingPercentile::new(clock.clone(), 6000, 6, 100, 0, true);
        (clock, percentile)
    }

    #[test]
    fn percentiles_over_uniform_samples() {
        let (_clock, percentile) = fixture();
        for latency in 1..=100 {
            percentile.add_value(latency);
        }
        assert_eq!(percentile.percentile(0.0), 1);
        assert_eq!(percentile.percentile(50.0), 51);
        assert_eq!(percentile.percentile(100.0), 100);
        assert_eq!(percentile.mean(), 50);
    }

    #[test]
    fn samples_age_out_with_their_bucket() {
        let (clock, percentile) = fixture();
        percentile.add_value(5000);
        clock.advance(6001);
        percentile.add_value(10);
        assert_eq!(percentile.percentile(100.0), 10);
    }

    #[test]
    fn reservoir_overwrites_once_full() {
        let clock = Arc::new(ManualClock::default());
        let percentile = RollingPercentile::new(clock, 6000, 6, 2, 0, true);
        percentile.add_value(1);
        percentile.add_value(2);
        percentile.add_value(9);
        // Capacity 2: the third sample overwrote the first.
        assert_eq!(percentile.percentile(100.0), 9);
        assert_eq!(percentile.percentile(0.0), 2);
    }

    #[test]
    fn disabled_ring_reports_zero() {
        let clock = Arc::new(ManualClock::default());
        let percentile = RollingPercentile::new(clock, 6000, 6, 100, 0, false);
        percentile.add_value(42);
        assert_eq!(percentile.percentile(99.0), 0);
        assert_eq!(percentile.mean(), 0);
    }

    #[test]
    fn snapshot_is_cached_for_the_interval() {
        let clock = Arc::new(ManualClock::default());
        let percentile = RollingPercentile::new(clock.clone(), 6000, 6, 100, 500, true);
        percentile.add_value(10);
        assert_eq!(percentile.percentile(100.0), 10);
        percentile.add_value(99);
        // Still inside the snapshot interval: stale value served.
        assert_eq!(percentile.percentile(100.0), 10);
        clock.advance(501);
        assert_eq!(percentile.percentile(100.0), 99);
    }
}
