//! Per-endpoint circuit breaker registry.
//!
//! Unlike most of the ambient stack here, breaker state transitions are
//! required to be linearizable under concurrent access without taking a
//! lock, so this is built directly on atomics rather than the
//! `tokio::sync::RwLock<State>` pattern used elsewhere for colder paths.
//! `Closed -> Open -> HalfOpen -> Closed` is driven entirely by
//! compare-and-swap; the `Open -> HalfOpen` probe transition is guaranteed
//! to succeed for exactly one caller per window because only one CAS wins.

use crate::events::{Event, EventBus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn raw(self) -> u8 {
        match self {
            BreakerState::Closed => STATE_CLOSED,
            BreakerState::Open => STATE_OPEN,
            BreakerState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn label(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Per-endpoint failure-counting state machine. `failures`, `state` and
/// `last_failure_nanos` are each independently atomic; the invariants that
/// span more than one field (e.g. "Open implies failures >= threshold")
/// are maintained by always writing failures before flipping state to
/// Open, and never reading them back together under a lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    state: AtomicU8,
    failures: AtomicU32,
    last_failure_nanos: AtomicI64,
    threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    fn new(endpoint: String, threshold: u32, open_timeout: Duration) -> Self {
        Self {
            endpoint,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            last_failure_nanos: AtomicI64::new(i64::MIN),
            threshold,
            open_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// True if the breaker currently blocks requests. As a side effect, an
    /// Open breaker whose `openTimeout` has elapsed transitions to
    /// HalfOpen exactly once and this call returns `false` for the
    /// winning caller (the probe is allowed through).
    pub fn is_open(&self, events: &EventBus) -> bool {
        let raw = self.state.load(Ordering::Acquire);
        if raw != STATE_OPEN {
            return false;
        }

        let last_failure = self.last_failure_nanos.load(Ordering::Acquire);
        let elapsed_nanos = now_nanos().saturating_sub(last_failure);
        if elapsed_nanos > self.open_timeout.as_nanos() as i64 {
            if self
                .state
                .compare_exchange(
                    STATE_OPEN,
                    STATE_HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                info!(endpoint = %self.endpoint, "circuit breaker probing half-open");
                events.publish(Event::CircuitBreakerHalfOpen {
                    endpoint: self.endpoint.clone(),
                });
                return false;
            }
            // Lost the race; whoever won is now HalfOpen or already past it.
            return self.state.load(Ordering::Acquire) == STATE_OPEN;
        }
        true
    }

    pub fn record_success(&self, events: &EventBus) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        self.failures.store(0, Ordering::Release);
        if previous != STATE_CLOSED {
            debug!(endpoint = %self.endpoint, "circuit breaker closed");
            events.publish(Event::CircuitBreakerClosed {
                endpoint: self.endpoint.clone(),
                previous_state: BreakerState::from_raw(previous).label(),
            });
        }
    }

    pub fn record_failure(&self, events: &EventBus) {
        self.last_failure_nanos.store(now_nanos(), Ordering::Release);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;

        if failures >= self.threshold {
            let previous = self.state.swap(STATE_OPEN, Ordering::AcqRel);
            if previous != STATE_OPEN {
                warn!(
                    endpoint = %self.endpoint,
                    failures,
                    threshold = self.threshold,
                    "circuit breaker opened"
                );
                events.publish(Event::CircuitBreakerOpened {
                    endpoint: self.endpoint.clone(),
                    failures,
                    threshold: self.threshold,
                });
            }
        }
    }

    fn has_recent_failure(&self, idle_threshold: Duration) -> bool {
        let last_failure = self.last_failure_nanos.load(Ordering::Acquire);
        if last_failure == i64::MIN {
            return false;
        }
        now_nanos().saturating_sub(last_failure) < idle_threshold.as_nanos() as i64
    }
}

/// Lazily-created, lock-free-on-the-hot-path registry of per-endpoint
/// breakers, keyed by endpoint name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    threshold: u32,
    open_timeout: Duration,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, open_timeout: Duration, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            open_timeout,
            events,
        }
    }

    /// Get-or-create under compare-and-swap-insert semantics: concurrent
    /// first callers for the same key converge on the same `Arc`.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    endpoint.to_string(),
                    self.threshold,
                    self.open_timeout,
                ))
            })
            .clone()
    }

    pub fn is_open(&self, endpoint: &str) -> bool {
        self.get_or_create(endpoint).is_open(&self.events)
    }

    pub fn record_success(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_success(&self.events);
    }

    pub fn record_failure(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_failure(&self.events);
    }

    /// Drop breakers for endpoints with no live pool that are Closed and
    /// have no failure within `idle_threshold`. Called from the pool
    /// sweeper alongside pool eviction.
    pub fn sweep(&self, live_endpoints: &dyn Fn(&str) -> bool, idle_threshold: Duration) {
        self.breakers.retain(|endpoint, breaker| {
            if live_endpoints(endpoint) {
                return true;
            }
            breaker.state() != BreakerState::Closed || breaker.has_recent_failure(idle_threshold)
        });
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(3, Duration::from_millis(50), EventBus::default())
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let registry = registry();
        for _ in 0..3 {
            registry.record_failure("a");
        }
        assert!(registry.is_open("a"));
        assert!(registry.get_or_create("a").failures() >= 3);
    }

    #[test]
    fn success_resets_failures_and_closes() {
        let registry = registry();
        registry.record_failure("a");
        registry.record_failure("a");
        registry.record_success("a");

        let breaker = registry.get_or_create("a");
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn half_open_probe_fires_once_after_timeout() {
        let registry = registry();
        for _ in 0..3 {
            registry.record_failure("a");
        }
        assert!(registry.is_open("a"));

        std::thread::sleep(Duration::from_millis(60));
        // First caller past the timeout gets the probe (is_open == false).
        assert!(!registry.is_open("a"));
        assert_eq!(registry.get_or_create("a").state(), BreakerState::HalfOpen);
    }

    #[test]
    fn failure_from_half_open_reopens() {
        let registry = registry();
        for _ in 0..3 {
            registry.record_failure("a");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(!registry.is_open("a"));
        registry.record_failure("a");
        assert!(registry.is_open("a"));
    }

    #[test]
    fn concurrent_get_or_create_returns_same_instance() {
        let registry = registry();
        let a = registry.get_or_create("x");
        let b = registry.get_or_create("x");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
