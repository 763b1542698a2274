//! C4 — Consumer Groups: named cursors over a queue's message log.
//!
//! A group's position only ever advances on acknowledgment (spec §4.4),
//! never on delivery — delivered-but-unacked messages stay pending and
//! are redelivered on the next `consume` if a caller never acks them
//! (the group has no redelivery timer of its own; `QueueHandle::pull`
//! simply re-reads from the same cursor).
//!
//! Grounded on the teacher's `ConsumerGroup` (`brokers/stream/group.rs`):
//! here the `ack_floor`/`pending`/`redeliver` triad collapses into the
//! queue runtime's cursor + the shared `AckMatrix`, since retention is
//! already centralized there (Design Notes §9) rather than re-derived
//! per group.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancellation::Cancellation;
use crate::config::GroupDefaults;
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::queue::QueueDirectory;
use crate::repository::MessageRepository;
use crate::time::current_time_ms;

#[derive(Clone, Hash, Eq, PartialEq)]
struct GroupKey {
    domain: String,
    queue: String,
    group_id: String,
}

struct GroupMeta {
    ttl_ms: u64,
    created_at: u64,
    last_activity: AtomicU64,
    consumer_ids: parking_lot::Mutex<HashSet<String>>,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub domain: String,
    pub queue: String,
    pub group_id: String,
    pub ttl_ms: u64,
    pub created_at: u64,
    pub last_activity: u64,
    pub pending_count: usize,
}

pub struct ConsumerGroupRegistry {
    groups: DashMap<GroupKey, GroupMeta>,
    repository: Arc<MessageRepository>,
    queues: QueueDirectory,
    defaults: GroupDefaults,
}

impl ConsumerGroupRegistry {
    pub fn new(repository: Arc<MessageRepository>, queues: QueueDirectory, defaults: GroupDefaults) -> Self {
        Self {
            groups: DashMap::new(),
            repository,
            queues,
            defaults,
        }
    }

    fn key(domain: &str, queue: &str, group_id: &str) -> GroupKey {
        GroupKey {
            domain: domain.to_string(),
            queue: queue.to_string(),
            group_id: group_id.to_string(),
        }
    }

    /// Idempotent: creating an already-live group only refreshes
    /// `last_activity` and leaves its cursor untouched.
    pub fn create(&self, domain: &str, queue: &str, group_id: &str, ttl: Option<Duration>) {
        let key = Self::key(domain, queue, group_id);
        let ttl_ms = ttl.map(|d| d.as_millis() as u64).unwrap_or(self.defaults.ttl.as_millis() as u64);

        if let Some(meta) = self.groups.get(&key) {
            meta.last_activity.store(current_time_ms(), Ordering::SeqCst);
            return;
        }

        self.repository
            .get_or_create_ack_matrix(domain, queue)
            .register_group(group_id);

        self.groups.insert(
            key,
            GroupMeta {
                ttl_ms,
                created_at: current_time_ms(),
                last_activity: AtomicU64::new(current_time_ms()),
                consumer_ids: parking_lot::Mutex::new(HashSet::new()),
            },
        );
    }

    /// Delivers up to `max_count` messages starting at the group's
    /// position, waiting up to `timeout` if none are immediately
    /// available. Does not advance the position — only `acknowledge`
    /// does that.
    pub async fn consume(
        &self,
        domain: &str,
        queue: &str,
        group_id: &str,
        consumer_id: Option<&str>,
        max_count: usize,
        timeout: Duration,
        cancellation: &Cancellation,
    ) -> CoreResult<Vec<(u64, Message)>> {
        self.create(domain, queue, group_id, None);
        if let Some(meta) = self.groups.get(&Self::key(domain, queue, group_id)) {
            if let Some(id) = consumer_id {
                meta.consumer_ids.lock().insert(id.to_string());
            }
        }

        let handle = self.queue_handle(domain, queue)?;
        let poll_interval = Duration::from_millis(25);

        let fetch = async {
            loop {
                let page = handle.pull(group_id, max_count).await?;
                if !page.is_empty() {
                    return Ok(page);
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        // A plain timeout with nothing available is not an error — it
        // just means zero messages this round; real fetch errors and
        // cancellation both propagate.
        let page = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(CoreError::Canceled),
            result = fetch => result?,
            _ = tokio::time::sleep(timeout) => Vec::new(),
        };

        if let Some(meta) = self.groups.get(&Self::key(domain, queue, group_id)) {
            meta.last_activity.store(current_time_ms(), Ordering::SeqCst);
        }
        Ok(page)
    }

    /// Acknowledges `message_id`; the queue runtime advances the cursor
    /// and the ack matrix decides retention.
    pub async fn acknowledge(
        &self,
        domain: &str,
        queue: &str,
        group_id: &str,
        message_id: Uuid,
    ) -> CoreResult<bool> {
        let handle = self.queue_handle(domain, queue)?;
        let fully_acked = handle.ack(group_id, message_id).await?;
        if let Some(meta) = self.groups.get(&Self::key(domain, queue, group_id)) {
            meta.last_activity.store(current_time_ms(), Ordering::SeqCst);
        }
        Ok(fully_acked)
    }

    /// Unregisters the group; the ack matrix may release messages that
    /// were only waiting on this group.
    pub fn remove(&self, domain: &str, queue: &str, group_id: &str) {
        self.groups.remove(&Self::key(domain, queue, group_id));
        let persistent = self
            .queues
            .get(&(domain.to_string(), queue.to_string()))
            .map(|entry| entry.value().config.persistent)
            .unwrap_or(true);
        let released = self.repository.release_group(domain, queue, group_id, persistent);
        if !released.is_empty() {
            debug!(domain, queue, group_id, count = released.len(), "group removal released messages");
        }
    }

    pub fn info(&self, domain: &str, queue: &str, group_id: &str) -> Option<GroupInfo> {
        let meta = self.groups.get(&Self::key(domain, queue, group_id))?;
        let ack_matrix = self.repository.get_or_create_ack_matrix(domain, queue);
        Some(GroupInfo {
            domain: domain.to_string(),
            queue: queue.to_string(),
            group_id: group_id.to_string(),
            ttl_ms: meta.ttl_ms,
            created_at: meta.created_at,
            last_activity: meta.last_activity.load(Ordering::SeqCst),
            pending_count: ack_matrix.pending_count(group_id),
        })
    }

    /// Scans all groups and removes those past their TTL; `ttl_ms == 0`
    /// means infinite and is never swept.
    pub fn sweep_expired(&self) -> usize {
        let now = current_time_ms();
        let expired: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|entry| {
                let meta = entry.value();
                meta.ttl_ms > 0 && now.saturating_sub(meta.last_activity.load(Ordering::SeqCst)) > meta.ttl_ms
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            info!(domain = %key.domain, queue = %key.queue, group_id = %key.group_id, "consumer group TTL expired");
            self.remove(&key.domain, &key.queue, &key.group_id);
        }
        expired.len()
    }

    fn queue_handle(&self, domain: &str, queue: &str) -> CoreResult<QueueHandle> {
        self.queues
            .get(&(domain.to_string(), queue.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("queue {domain}/{queue}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerDefaults, QueueDefaults, RetryDefaults};
    use crate::queue::QueueConfig;
    use bytes::Bytes;

    fn setup() -> (Arc<MessageRepository>, QueueDirectory, ConsumerGroupRegistry) {
        let repository = Arc::new(MessageRepository::new());
        let queues: QueueDirectory = Arc::new(DashMap::new());

        let queue_defaults = QueueDefaults::default();
        let cfg = QueueConfig {
            persistent: true,
            max_size: 0,
            ttl_ms: 0,
            worker_count: 2,
            enqueue_wait: queue_defaults.enqueue_wait,
            stop_grace: queue_defaults.stop_grace,
            retry: RetryDefaults::default(),
            breaker: BreakerDefaults::default(),
        };
        let (failures, _) = tokio::sync::broadcast::channel(16);
        let handle = crate::queue::spawn(
            "D".to_string(),
            "Q".to_string(),
            cfg,
            Arc::clone(&repository),
            Cancellation::root(),
            failures,
        );
        queues.insert(("D".to_string(), "Q".to_string()), handle);

        let registry = ConsumerGroupRegistry::new(Arc::clone(&repository), Arc::clone(&queues), GroupDefaults::default());
        (repository, queues, registry)
    }

    #[tokio::test]
    async fn create_is_idempotent_and_registers_with_ack_matrix() {
        let (repository, _queues, registry) = setup();
        registry.create("D", "Q", "G", None);
        registry.create("D", "Q", "G", None);
        assert!(repository.get_or_create_ack_matrix("D", "Q").is_active("G"));
    }

    #[tokio::test]
    async fn consume_then_ack_advances_position() {
        let (_repository, queues, registry) = setup();
        registry.create("D", "Q", "G", None);

        let handle = queues.get(&("D".to_string(), "Q".to_string())).unwrap().value().clone();
        let msg = Message::new("t", Bytes::from_static(b"p"));
        let id = msg.id;
        handle.enqueue(msg).await.unwrap();

        let cancellation = Cancellation::root();
        let page = registry
            .consume("D", "Q", "G", Some("c1"), 10, Duration::from_millis(200), &cancellation)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].1.id, id);

        let fully_acked = registry.acknowledge("D", "Q", "G", id).await.unwrap();
        assert!(fully_acked);
    }

    #[tokio::test]
    async fn remove_releases_orphaned_messages() {
        let (repository, queues, registry) = setup();
        registry.create("D", "Q", "Ga", None);
        registry.create("D", "Q", "Gb", None);

        let handle = queues.get(&("D".to_string(), "Q".to_string())).unwrap().value().clone();
        let msg = Message::new("t", Bytes::from_static(b"p"));
        handle.enqueue(msg).await.unwrap();

        let cancellation = Cancellation::root();
        registry
            .consume("D", "Q", "Ga", None, 10, Duration::from_millis(200), &cancellation)
            .await
            .unwrap();
        let page = registry
            .consume("D", "Q", "Gb", None, 10, Duration::from_millis(200), &cancellation)
            .await
            .unwrap();
        let id = page[0].1.id;
        registry.acknowledge("D", "Q", "Ga", id).await.unwrap();

        registry.remove("D", "Q", "Gb");
        assert_eq!(repository.queue_len("D", "Q"), 0);
    }
}
