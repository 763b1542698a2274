//! Supervisor / stats (spec §2 component table, expanded in SPEC_FULL §4.8):
//! the failure-event channel terminal retry exhaustion and background
//! tasks report to, plus resource snapshots and periodic cleanup.
//!
//! Grounded on the teacher's `NexoEngine` aggregator
//! (`dashboard/models/system.rs` `SystemSnapshot`/`BrokersSnapshot`):
//! there, a dashboard-facing struct collects one snapshot type per broker.
//! Here it generalizes into `SupervisorSnapshot` aggregating per-queue
//! `QueueStats`, read by `Core::snapshot()` rather than rendered to a UI
//! (the UI is out of scope). The periodic cleanup loop mirrors the
//! teacher's `tokio::spawn` loop in `NexoEngine::new` that ticks
//! `cleanup_expired_retained` every 60s — here it ticks the consumer
//! group TTL sweep instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::cancellation::Cancellation;
use crate::consumer_group::ConsumerGroupRegistry;
use crate::queue::QueueStats;

/// Background/terminal-delivery failures the core cannot surface
/// synchronously to a publisher (spec §7): retry exhaustion, and
/// background task errors (TTL sweep, watcher, debounced writes).
#[derive(Debug, Clone)]
pub enum FailureEvent {
    RetryExhausted {
        domain: String,
        queue: String,
        message_id: Uuid,
        attempts: u32,
    },
    Background {
        component: &'static str,
        message: String,
    },
}

pub type FailureSender = broadcast::Sender<FailureEvent>;

#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub queues: Vec<QueueStats>,
    pub uptime: Duration,
}

pub struct Supervisor {
    failures_tx: FailureSender,
    started_at: std::time::Instant,
}

impl Supervisor {
    pub fn new() -> Self {
        let (failures_tx, _) = broadcast::channel(256);
        Self {
            failures_tx,
            started_at: std::time::Instant::now(),
        }
    }

    /// Cloned into every queue runtime at spawn time so terminal retry
    /// failures can be emitted without the queue depending on the
    /// supervisor directly.
    pub fn failure_sender(&self) -> FailureSender {
        self.failures_tx.clone()
    }

    /// Callers (transport adapters) observe background/terminal failures
    /// here without the core ever blocking on them (spec §7).
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureEvent> {
        self.failures_tx.subscribe()
    }

    pub fn emit_background_failure(&self, component: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!(component, %message, "background task failure");
        let _ = self.failures_tx.send(FailureEvent::Background { component, message });
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Spawns the one recurring cleanup task the core owns directly: the
    /// consumer-group TTL sweep (spec §4.4). Per-service `last_used`
    /// flush debouncing is event-driven and lives with the service
    /// account store itself, not here.
    pub fn spawn_group_sweep(
        self: &Arc<Self>,
        groups: Arc<ConsumerGroupRegistry>,
        interval: Duration,
        cancellation: Cancellation,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = groups.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "consumer group TTL sweep");
                        }
                    }
                }
            }
        });
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
