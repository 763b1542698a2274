//! C3 — Channel Queue: bounded buffer, worker pool, subscriber fan-out,
//! retry pipeline and circuit breaker (spec §4.3).

mod circuit_breaker;
mod config;
mod retry;
mod runtime;

use std::sync::Arc;

use dashmap::DashMap;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use config::QueueConfig;
pub use retry::{RetryEntry, RetryScheduler};
pub use runtime::{spawn, QueueHandle, QueueStats, SubscriberHandler};

/// Shared `(domain, queue) -> QueueHandle` directory. Populated by the
/// domain manager as queues are created; consulted by consumer groups and
/// the routing engine to reach a queue's runtime without depending on the
/// domain manager itself.
pub type QueueDirectory = Arc<DashMap<(String, String), QueueHandle>>;
