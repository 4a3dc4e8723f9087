use crate::error::CommandError;
use crate::metrics::EventType;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Immutable record of one finished execution. This is what the request
/// cache stores: duplicate callers receive the record untouched and layer
/// their own `ResponseFromCache` view on top, never mutating it.
#[derive(Debug, Clone)]
pub struct CommandResponse<T> {
    outcome: Result<T, CommandError>,
    events: Vec<EventType>,
    execution_time_ms: i64,
}

impl<T: Clone> CommandResponse<T> {
    pub(crate) fn new(
        outcome: Result<T, CommandError>,
        events: Vec<EventType>,
        execution_time_ms: i64,
    ) -> Self {
        Self {
            outcome,
            events,
            execution_time_ms,
        }
    }

    pub fn outcome(&self) -> &Result<T, CommandError> {
        &self.outcome
    }

    pub fn events(&self) -> &[EventType] {
        &self.events
    }

    pub fn execution_time_ms(&self) -> i64 {
        self.execution_time_ms
    }
}

/// Sentinel for "not actually executed" (cache hits, never-run commands).
pub(crate) const TIME_NOT_EXECUTED: i64 = -1;

/// Mutable accumulator for the execution in flight: ordered events and the
/// measured wall time. Observable through the command's response flags once
/// the invocation completes.
#[derive(Debug)]
pub(crate) struct ExecutionState {
    events: Mutex<Vec<EventType>>,
    execution_time_ms: AtomicI64,
}

impl ExecutionState {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            execution_time_ms: AtomicI64::new(TIME_NOT_EXECUTED),
        }
    }

    pub(crate) fn record(&self, event: EventType) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Splice the original execution's events in front of this consumer's
    /// own (cache-hit wrapping).
    pub(crate) fn prepend(&self, events: &[EventType]) {
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged = Vec::with_capacity(events.len() + guard.len());
        merged.extend_from_slice(events);
        merged.extend_from_slice(&guard);
        *guard = merged;
    }

    pub(crate) fn contains(&self, event: EventType) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&event)
    }

    pub(crate) fn events(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_execution_time(&self, millis: i64) {
        self.execution_time_ms.store(millis, Ordering::Release);
    }

    pub(crate) fn execution_time_ms(&self) -> i64 {
        self.execution_time_ms.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_executed_with_no_events() {
        let state = ExecutionState::new();
        assert_eq!(state.execution_time_ms(), TIME_NOT_EXECUTED);
        assert!(state.events().is_empty());
    }

    #[test]
    fn records_events_in_order() {
        let state = ExecutionState::new();
        state.record(EventType::Failure);
        state.record(EventType::FallbackSuccess);
        assert_eq!(
            state.events(),
            vec![EventType::Failure, EventType::FallbackSuccess]
        );
        assert!(state.contains(EventType::Failure));
        assert!(!state.contains(EventType::Timeout));
    }

    #[test]
    fn prepend_places_original_events_first() {
        let state = ExecutionState::new();
        state.record(EventType::ResponseFromCache);
        state.prepend(&[EventType::Success]);
        assert_eq!(
            state.events(),
            vec![EventType::Success, EventType::ResponseFromCache]
        );
    }
}
