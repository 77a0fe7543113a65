// src/worker/breaker.rs

//! Per-key circuit breaker.
//!
//! After `fail_max` consecutive failures a key is open for `reset_timeout`.
//! Once that passes the next attempt simply proceeds (half-open by
//! timeout): a success closes the key, another failure reopens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub failure_count: u32,
    /// `None` means closed.
    pub open_until: Option<Instant>,
}

/// Whether an attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    CircuitOpen { retry_after: Duration },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    fail_max: u32,
    reset_timeout: Duration,
    states: HashMap<String, CircuitState>,
}

impl CircuitBreaker {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max: fail_max.max(1),
            reset_timeout,
            states: HashMap::new(),
        }
    }

    pub fn record_success(&mut self, key: &str) {
        if let Some(state) = self.states.get_mut(key) {
            if state.open_until.is_some() || state.failure_count > 0 {
                info!(key, "circuit closed after success");
            }
            state.failure_count = 0;
            state.open_until = None;
        }
    }

    pub fn record_failure(&mut self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub fn record_failure_at(&mut self, key: &str, now: Instant) {
        let state = self.states.entry(key.to_string()).or_insert(CircuitState {
            failure_count: 0,
            open_until: None,
        });
        state.failure_count = state.failure_count.saturating_add(1);
        if state.failure_count >= self.fail_max {
            state.open_until = Some(now + self.reset_timeout);
            warn!(
                key,
                failures = state.failure_count,
                reset_timeout = ?self.reset_timeout,
                "circuit opened"
            );
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.is_open_at(key, Instant::now())
    }

    pub fn is_open_at(&self, key: &str, now: Instant) -> bool {
        self.states
            .get(key)
            .and_then(|s| s.open_until)
            .is_some_and(|until| now < until)
    }

    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &str, now: Instant) -> Admission {
        match self.states.get(key).and_then(|s| s.open_until) {
            Some(until) if now < until => Admission::CircuitOpen {
                retry_after: until - now,
            },
            _ => Admission::Allowed,
        }
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.states.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_fail_max_and_closes_after_timeout() {
        let reset = Duration::from_secs(30);
        let mut cb = CircuitBreaker::new(3, reset);
        let t0 = Instant::now();

        cb.record_failure_at("render", t0);
        cb.record_failure_at("render", t0);
        assert!(!cb.is_open_at("render", t0));

        cb.record_failure_at("render", t0);
        assert!(cb.is_open_at("render", t0));
        assert!(cb.is_open_at("render", t0 + Duration::from_secs(29)));
        assert_eq!(
            cb.admit_at("render", t0 + Duration::from_secs(10)),
            Admission::CircuitOpen {
                retry_after: Duration::from_secs(20)
            }
        );

        let later = t0 + reset;
        assert!(!cb.is_open_at("render", later));
        assert_eq!(cb.admit_at("render", later), Admission::Allowed);

        // Half-open: one more failure reopens immediately.
        cb.record_failure_at("render", later);
        assert!(cb.is_open_at("render", later));
    }

    #[test]
    fn success_resets_the_counter() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(5));
        let now = Instant::now();
        cb.record_failure_at("k", now);
        cb.record_success("k");
        assert_eq!(cb.state("k").map(|s| s.failure_count), Some(0));
        cb.record_failure_at("k", now);
        assert!(!cb.is_open_at("k", now));
    }

    #[test]
    fn keys_are_independent_and_lazy() {
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(5));
        assert!(cb.state("a").is_none());
        cb.record_success("a");
        assert!(cb.state("a").is_none());
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(!cb.is_open("b"));
    }
}
