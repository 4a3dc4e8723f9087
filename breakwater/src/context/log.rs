use crate::keys::CommandKey;
use crate::metrics::EventType;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Entries beyond this are discarded; a runaway request should not turn the
/// log into a leak.
pub const MAX_LOG_SIZE: usize = 1000;

/// One executed command as recorded in the request log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub command: CommandKey,
    pub events: Vec<EventType>,
    /// Wall time of the actual execution; `-1` for responses served from the
    /// request cache.
    pub execution_time_ms: i64,
}

/// Append-only, bounded record of the commands executed within one request,
/// in insertion order.
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Mutex<Vec<LogEntry>>,
    overflow_warned: AtomicBool,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_LOG_SIZE {
            if !self.overflow_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    target: "breakwater::context",
                    limit = MAX_LOG_SIZE,
                    "request log is full, discarding further entries"
                );
            }
            return;
        }
        entries.push(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Comma-joined per-request summary. Each aggregate renders as
    /// `Key[Event, …][<sum ms>ms]` with an `xN` suffix when the same
    /// key+events combination occurred more than once. Events are sorted;
    /// negative (not-executed) times contribute nothing to the sum. Never
    /// fails: any rendering problem degrades to `"Unknown"`.
    pub fn summary(&self) -> String {
        self.try_summary().unwrap_or_else(|_| "Unknown".to_string())
    }

    fn try_summary(&self) -> Result<String, std::fmt::Error> {
        let entries = self.entries();

        // Aggregate identical key+events combinations, keeping first-seen
        // order.
        let mut order: Vec<String> = Vec::new();
        let mut aggregates: HashMap<String, (u64, i64)> = HashMap::new();
        for entry in &entries {
            let mut events = entry.events.clone();
            events.sort();
            let mut display = String::new();
            write!(display, "{}[", entry.command)?;
            for (index, event) in events.iter().enumerate() {
                if index > 0 {
                    display.push_str(", ");
                }
                write!(display, "{event}")?;
            }
            display.push(']');

            let slot = aggregates.entry(display.clone()).or_insert_with(|| {
                order.push(display);
                (0, 0)
            });
            slot.0 += 1;
            if entry.execution_time_ms >= 0 {
                slot.1 += entry.execution_time_ms;
            }
        }

        let mut rendered = String::new();
        for (index, display) in order.iter().enumerate() {
            let (count, latency) = aggregates[display];
            if index > 0 {
                rendered.push_str(", ");
            }
            write!(rendered, "{display}[{latency}ms]")?;
            if count > 1 {
                write!(rendered, "x{count}")?;
            }
        }
        Ok(rendered)
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.overflow_warned.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str, events: Vec<EventType>, time: i64) -> LogEntry {
        LogEntry {
            command: CommandKey::new(command),
            events,
            execution_time_ms: time,
        }
    }

    #[test]
    fn renders_single_entry() {
        let log = RequestLog::new();
        log.record(entry("GetData", vec![EventType::Success], 1));
        assert_eq!(log.summary(), "GetData[Success][1ms]");
    }

    #[test]
    fn aggregates_identical_key_and_events() {
        let log = RequestLog::new();
        log.record(entry(
            "TestCommand",
            vec![EventType::Failure, EventType::FallbackFailure],
            1,
        ));
        log.record(entry(
            "TestCommand",
            vec![EventType::FallbackFailure, EventType::Failure],
            1,
        ));
        assert_eq!(
            log.summary(),
            "TestCommand[Failure, FallbackFailure][2ms]x2"
        );
    }

    #[test]
    fn sorts_events_and_keeps_entry_order() {
        let log = RequestLog::new();
        log.record(entry("GetData", vec![EventType::Success], 1));
        log.record(entry("PutData", vec![EventType::Success], 1));
        log.record(entry(
            "GetValues",
            vec![EventType::ResponseFromCache, EventType::Success],
            -1,
        ));
        assert_eq!(
            log.summary(),
            "GetData[Success][1ms], PutData[Success][1ms], GetValues[Success, ResponseFromCache][0ms]"
        );
    }

    #[test]
    fn negative_times_do_not_reduce_the_sum() {
        let log = RequestLog::new();
        log.record(entry("Cached", vec![EventType::Success], 3));
        log.record(entry("Cached", vec![EventType::Success], -1));
        assert_eq!(log.summary(), "Cached[Success][3ms]x2");
    }

    #[test]
    fn rendering_is_pure() {
        let log = RequestLog::new();
        log.record(entry("Stable", vec![EventType::Success], 2));
        assert_eq!(log.summary(), log.summary());
    }

    #[test]
    fn caps_at_max_size() {
        let log = RequestLog::new();
        for _ in 0..(MAX_LOG_SIZE + 5) {
            log.record(entry("Spam", vec![EventType::Success], 0));
        }
        assert_eq!(log.len(), MAX_LOG_SIZE);
    }
}
