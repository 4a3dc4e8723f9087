//! Rolling, bucketed metrics: event counters, latency percentiles and the
//! per-command aggregator the circuit breaker reads its health from.

pub mod command_metrics;
pub mod rolling_number;
pub mod rolling_percentile;

pub use command_metrics::{CommandMetrics, CommandMetricsSnapshot, HealthCounts};
pub use rolling_number::{RollingNumber, RollingNumberEvent};
pub use rolling_percentile::RollingPercentile;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;

/// Everything recorded about a single command execution, doubling as the
/// rolling counter taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
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
}

impl EventType {
    pub const COUNT: usize = 12;

    pub const ALL: [EventType; EventType::COUNT] = [
        EventType::Success,
        EventType::Failure,
        EventType::Timeout,
        EventType::ShortCircuited,
        EventType::ThreadPoolRejected,
        EventType::SemaphoreRejected,
        EventType::FallbackSuccess,
        EventType::FallbackFailure,
        EventType::FallbackRejection,
        EventType::ExceptionThrown,
        EventType::ResponseFromCache,
        EventType::Collapsed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventType::Success => "Success",
            EventType::Failure => "Failure",
            EventType::Timeout => "Timeout",
            EventType::ShortCircuited => "ShortCircuited",
            EventType::ThreadPoolRejected => "ThreadPoolRejected",
            EventType::SemaphoreRejected => "SemaphoreRejected",
            EventType::FallbackSuccess => "FallbackSuccess",
            EventType::FallbackFailure => "FallbackFailure",
            EventType::FallbackRejection => "FallbackRejection",
            EventType::ExceptionThrown => "ExceptionThrown",
            EventType::ResponseFromCache => "ResponseFromCache",
            EventType::Collapsed => "Collapsed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Millisecond time source for window rotation and the breaker sleep window.
/// Swappable so bucket math is testable without real sleeps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

pub type SharedClock = std::sync::Arc<dyn Clock>;

static PROCESS_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic wall clock anchored at first use within the process.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        PROCESS_EPOCH.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic window tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, millis: u64) {
        self.millis
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(std::sync::atomic::Ordering::SeqCst)
    }
}
