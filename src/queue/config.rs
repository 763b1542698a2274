//! Per-queue configuration (spec §3): persistence, capacity, TTL, worker
//! pool size, and the retry/breaker blocks governing delivery.
//!
//! Grounded on the teacher's per-queue `QueueConfig`
//! (`brokers/queues/queue.rs`), stripped of the teacher's on-disk
//! persistence knobs (disk-backed queue persistence is a Non-goal here)
//! and extended with the breaker block the spec requires.

use std::time::Duration;

use crate::config::{BreakerDefaults, Config, RetryDefaults};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub persistent: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub worker_count: usize,
    pub enqueue_wait: Duration,
    pub stop_grace: Duration,
    pub retry: RetryDefaults,
    pub breaker: BreakerDefaults,
}

impl QueueConfig {
    pub fn from_defaults(cfg: &Config, persistent: bool) -> Self {
        Self {
            persistent,
            max_size: cfg.queue.max_size,
            ttl_ms: cfg.queue.ttl_ms,
            worker_count: cfg.queue.worker_count.max(1),
            enqueue_wait: cfg.queue.enqueue_wait,
            stop_grace: cfg.queue.stop_grace,
            retry: cfg.retry.clone(),
            breaker: cfg.breaker.clone(),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }
}
