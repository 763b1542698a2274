//! Per-queue circuit breaker (spec §4.3).
//!
//! Grounded on the teacher's `ConsumerGroup`/`QueueState` state-machine
//! style (discrete enum state transitioned under a single lock,
//! `brokers/stream/group.rs`), generalized into the Closed/Open/HalfOpen
//! machine the spec requires.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::BreakerDefaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failure_count: u64,
    success_count: u64,
    total_count: u64,
    half_open_probes_issued: u64,
    last_state_change: Instant,
    next_attempt: Option<Instant>,
}

pub struct CircuitBreaker {
    enabled: bool,
    error_ratio: f64,
    min_requests: u64,
    open_timeout: Duration,
    success_threshold: u64,
    half_open_probes: u64,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: &BreakerDefaults) -> Self {
        Self {
            enabled: cfg.enabled,
            error_ratio: cfg.error_ratio,
            min_requests: cfg.min_requests,
            open_timeout: cfg.open_timeout,
            success_threshold: cfg.success_threshold,
            half_open_probes: cfg.half_open_probes,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                total_count: 0,
                half_open_probes_issued: 0,
                last_state_change: Instant::now(),
                next_attempt: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    /// Whether a delivery attempt should be allowed right now. Transitions
    /// Open -> HalfOpen once `next_attempt` has elapsed (invariant 4: no
    /// handler invoked while `Open` and before `next_attempt`).
    pub fn allow(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.next_attempt.map(|at| Instant::now() >= at).unwrap_or(false) {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    inner.half_open_probes_issued = 0;
                    inner.success_count = 0;
                    inner.half_open_probes_issued += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes_issued < self.half_open_probes {
                    inner.half_open_probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.write();
        inner.total_count += 1;
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.total_count = 0;
                    inner.last_state_change = Instant::now();
                    inner.next_attempt = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.write();
        inner.total_count += 1;
        inner.failure_count += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.total_count >= self.min_requests
                    && (inner.failure_count as f64 / inner.total_count as f64) >= self.error_ratio
                {
                    self.trip(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.trip(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.last_state_change = Instant::now();
        inner.next_attempt = Some(Instant::now() + self.open_timeout);
        inner.success_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(error_ratio: f64, min_requests: u64, open_timeout: Duration) -> BreakerDefaults {
        BreakerDefaults {
            enabled: true,
            error_ratio,
            min_requests,
            open_timeout,
            success_threshold: 2,
            half_open_probes: 5,
        }
    }

    #[test]
    fn opens_on_failure_burst() {
        // Scenario S4
        let breaker = CircuitBreaker::new(&cfg(0.5, 4, Duration::from_secs(30)));
        for _ in 0..4 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn half_open_then_closed_on_success_threshold() {
        let breaker = CircuitBreaker::new(&cfg(0.5, 2, Duration::from_millis(1)));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow()); // trips to HalfOpen
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(&cfg(0.5, 2, Duration::from_millis(1)));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let mut c = cfg(0.1, 1, Duration::from_secs(30));
        c.enabled = false;
        let breaker = CircuitBreaker::new(&c);
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
    }
}
