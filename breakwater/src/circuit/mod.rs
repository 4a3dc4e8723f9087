//! Health-driven circuit breaker: Closed / Open / HalfOpen over the rolling
//! metrics window, with a single-probe recovery race per sleep window.

use crate::keys::CommandKey;
use crate::metrics::{CommandMetrics, SharedClock};
use crate::properties::CommandProperties;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use tracing::debug;

/// Effective breaker state, for introspection. The runtime itself only asks
/// [`CircuitBreaker::allow_request`] and [`CircuitBreaker::is_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-command breaker. Trips open when the health snapshot crosses the
/// configured error percentage at sufficient volume; after the sleep window
/// it admits exactly one probe, closing again only on `mark_success`.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: CommandKey,
    properties: Arc<CommandProperties>,
    metrics: Arc<CommandMetrics>,
    clock: SharedClock,
    open: AtomicBool,
    /// When the circuit opened, refreshed by each admitted probe so only one
    /// caller per sleep window wins the CAS.
    opened_or_last_tested_at: AtomicU64,
}

impl CircuitBreaker {
    /// Fetch or create the process-wide breaker for `key`. Racing
    /// constructors are discarded.
    pub fn instance(
        key: &CommandKey,
        properties: &Arc<CommandProperties>,
        metrics: &Arc<CommandMetrics>,
        clock: &SharedClock,
    ) -> Arc<CircuitBreaker> {
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
        let created = Arc::new(CircuitBreaker {
            key: key.clone(),
            properties: Arc::clone(properties),
            metrics: Arc::clone(metrics),
            clock: Arc::clone(clock),
            open: AtomicBool::new(false),
            opened_or_last_tested_at: AtomicU64::new(0),
        });
        map.insert(key.clone(), Arc::clone(&created));
        created
    }

    /// Whether this invocation may proceed. Open breakers reject everything
    /// until the sleep window elapses, then admit a single probe.
    pub fn allow_request(&self) -> bool {
        if !self.properties.circuit_breaker_enabled {
            return true;
        }
        if self.properties.circuit_breaker_force_open {
            return false;
        }
        if self.properties.circuit_breaker_force_closed {
            // Still evaluate health so counts and state stay observable.
            let _ = self.evaluate();
            return true;
        }
        !self.evaluate() || self.allow_single_probe()
    }

    /// Whether the circuit is open. On a closed circuit this opportunistically
    /// evaluates the health predicate and may trip open as a side effect.
    pub fn is_open(&self) -> bool {
        if !self.properties.circuit_breaker_enabled {
            return false;
        }
        if self.properties.circuit_breaker_force_open {
            return true;
        }
        if self.properties.circuit_breaker_force_closed {
            let _ = self.evaluate();
            return false;
        }
        self.evaluate()
    }

    fn evaluate(&self) -> bool {
        if self.open.load(Ordering::Acquire) {
            return true;
        }
        let health = self.metrics.health_counts();
        if health.total_requests < self.properties.circuit_breaker_request_volume_threshold {
            return false;
        }
        if health.error_percentage
            < self.properties.circuit_breaker_error_threshold_percentage
        {
            return false;
        }
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.opened_or_last_tested_at
                .store(self.clock.now_millis(), Ordering::Release);
            debug!(
                target: "breakwater::circuit",
                command = %self.key,
                error_percentage = health.error_percentage,
                total_requests = health.total_requests,
                "circuit opened"
            );
        }
        true
    }

    /// A successful probe execution closes the circuit and zeroes the rolling
    /// counters so the stale error window cannot re-trip it immediately.
    pub fn mark_success(&self) {
        if self.properties.circuit_breaker_enabled && self.open.load(Ordering::Acquire) {
            self.metrics.reset_counters();
            self.open.store(false, Ordering::Release);
            debug!(target: "breakwater::circuit", command = %self.key, "circuit closed");
        }
    }

    /// Introspection only.
    pub fn state(&self) -> CircuitState {
        if !self.open.load(Ordering::Acquire) {
            return CircuitState::Closed;
        }
        let opened = self.opened_or_last_tested_at.load(Ordering::Acquire);
        let sleep = self.properties.circuit_breaker_sleep_window.as_millis() as u64;
        if self.clock.now_millis().saturating_sub(opened) >= sleep {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn allow_single_probe(&self) -> bool {
        let opened = self.opened_or_last_tested_at.load(Ordering::Acquire);
        let sleep = self.properties.circuit_breaker_sleep_window.as_millis() as u64;
        let now = self.clock.now_millis();
        if self.open.load(Ordering::Acquire) && now.saturating_sub(opened) >= sleep {
            // One winner per sleep window; losers keep seeing Open.
            let won = self
                .opened_or_last_tested_at
                .compare_exchange(opened, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if won {
                debug!(
                    target: "breakwater::circuit",
                    command = %self.key,
                    "half-open probe admitted"
                );
            }
            return won;
        }
        false
    }
}

type Registry = RwLock<HashMap<CommandKey, Arc<CircuitBreaker>>>;

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| RwLock::new(HashMap::new()));

fn registry() -> &'static Registry {
    &REGISTRY
}

/// Keys of every registered breaker.
pub fn registered_breakers() -> Vec<CommandKey> {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect()
}

/// Testing hook: drop every registered breaker.
pub(crate) fn reset_registry() {
    registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
