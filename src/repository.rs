//! C2 — Message Repository: sole source of truth for message payloads.
//!
//! Indexes messages by `(domain, queue)` into a monotonically-increasing
//! sequence; `get_messages_after_index` is the only iteration primitive
//! consumer groups use (spec §4.2) — nothing else is allowed to scan the
//! whole queue. `acknowledge` delegates retention decisions to the
//! per-queue `AckMatrix` and only deletes when the matrix reports full
//! acknowledgment *and* the queue is persistent.
//!
//! Grounded on the teacher's `QueueState` registry/index split
//! (`brokers/queues/queue.rs`), generalized from per-queue `HashMap` +
//! `BTreeMap` indices guarded by the owning actor into a `DashMap`-keyed
//! per-(domain,queue) log guarded by its own lock, since the repository
//! here is shared across the whole core rather than owned by one actor.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::ack_matrix::AckMatrix;
use crate::message::Message;

struct QueueLog {
    next_index: AtomicU64,
    entries: RwLock<BTreeMap<u64, Message>>,
    index_of: RwLock<HashMap<Uuid, u64>>,
    ack_matrix: Arc<AckMatrix>,
}

impl QueueLog {
    fn new() -> Self {
        Self {
            next_index: AtomicU64::new(0),
            entries: RwLock::new(BTreeMap::new()),
            index_of: RwLock::new(HashMap::new()),
            ack_matrix: Arc::new(AckMatrix::new()),
        }
    }
}

#[derive(Clone, Hash, Eq, PartialEq)]
struct QueueKey {
    domain: String,
    queue: String,
}

pub struct MessageRepository {
    logs: DashMap<QueueKey, QueueLog>,
}

impl MessageRepository {
    pub fn new() -> Self {
        Self { logs: DashMap::new() }
    }

    fn key(domain: &str, queue: &str) -> QueueKey {
        QueueKey {
            domain: domain.to_string(),
            queue: queue.to_string(),
        }
    }

    fn log_entry<'a>(&'a self, domain: &str, queue: &str) -> dashmap::mapref::one::RefMut<'a, QueueKey, QueueLog> {
        self.logs
            .entry(Self::key(domain, queue))
            .or_insert_with(QueueLog::new)
    }

    /// Stores `message` at the next sequence index for `(domain, queue)`.
    /// If `persistent`, the message is registered with the queue's ack
    /// matrix so it is retained until every active group acknowledges it.
    pub fn store(&self, domain: &str, queue: &str, message: Message, persistent: bool) -> u64 {
        let log = self.log_entry(domain, queue);
        let index = log.next_index.fetch_add(1, Ordering::SeqCst);

        let id = message.id;
        log.entries.write().insert(index, message);
        log.index_of.write().insert(id, index);

        if persistent {
            log.ack_matrix.track(id);
        }
        index
    }

    pub fn get_by_id(&self, domain: &str, queue: &str, id: Uuid) -> Option<Message> {
        let log = self.logs.get(&Self::key(domain, queue))?;
        let index = *log.index_of.read().get(&id)?;
        log.entries.read().get(&index).cloned()
    }

    pub fn get_messages(&self, domain: &str, queue: &str, limit: usize) -> Vec<Message> {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return Vec::new();
        };
        log.entries.read().values().take(limit).cloned().collect()
    }

    /// The sole iteration primitive consumer groups use: messages whose
    /// sequence index is `>= start`, oldest first, capped at `limit`.
    pub fn get_messages_after_index(&self, domain: &str, queue: &str, start: u64, limit: usize) -> Vec<(u64, Message)> {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return Vec::new();
        };
        log.entries
            .read()
            .range(start..)
            .take(limit)
            .map(|(idx, msg)| (*idx, msg.clone()))
            .collect()
    }

    pub fn delete(&self, domain: &str, queue: &str, id: Uuid) -> bool {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return false;
        };
        let Some(index) = log.index_of.write().remove(&id) else {
            return false;
        };
        log.entries.write().remove(&index).is_some()
    }

    pub fn queue_len(&self, domain: &str, queue: &str) -> usize {
        self.logs
            .get(&Self::key(domain, queue))
            .map(|log| log.entries.read().len())
            .unwrap_or(0)
    }

    /// Returns the ack matrix governing retention for this queue, creating
    /// an empty log (and matrix) on first access.
    pub fn get_or_create_ack_matrix(&self, domain: &str, queue: &str) -> Arc<AckMatrix> {
        Arc::clone(&self.log_entry(domain, queue).ack_matrix)
    }

    /// Acknowledge `message_id` on behalf of `group_id`. Persistent
    /// queues delete the message once the ack matrix reports full
    /// acknowledgment; non-persistent queues delete it on this first ack
    /// regardless, since their messages are retained only until dequeued
    /// (spec §3 lifecycles, point (b)) rather than governed by the ack
    /// matrix at all.
    pub fn acknowledge(&self, domain: &str, queue: &str, group_id: &str, message_id: Uuid, persistent: bool) -> bool {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return false;
        };
        let fully_acked = log.ack_matrix.acknowledge(message_id, group_id);
        if !persistent || fully_acked {
            drop(log);
            self.delete(domain, queue, message_id);
        }
        fully_acked
    }

    /// Unregisters `group_id` from this queue's ack matrix and, if the
    /// queue is persistent, deletes any messages the matrix reports as
    /// newly released. Used by consumer-group removal (spec §4.4).
    pub fn release_group(&self, domain: &str, queue: &str, group_id: &str, persistent: bool) -> Vec<Uuid> {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return Vec::new();
        };
        let released = log.ack_matrix.remove_group(group_id);
        drop(log);
        if persistent {
            for id in &released {
                self.delete(domain, queue, *id);
            }
        }
        released
    }

    /// Deletes every message in `(domain, queue)` older than `max_age_ms`
    /// (spec §3: "ttl (0 = infinite)"). Returns the ids removed.
    pub fn expire_older_than(&self, domain: &str, queue: &str, max_age_ms: u64) -> Vec<Uuid> {
        let Some(log) = self.logs.get(&Self::key(domain, queue)) else {
            return Vec::new();
        };
        let now = crate::time::current_time_ms();
        let expired: Vec<Uuid> = log
            .entries
            .read()
            .values()
            .filter(|msg| now.saturating_sub(msg.timestamp) > max_age_ms)
            .map(|msg| msg.id)
            .collect();
        drop(log);

        expired.into_iter().filter(|id| self.delete(domain, queue, *id)).collect()
    }

    pub fn purge_queue(&self, domain: &str, queue: &str) {
        self.logs.remove(&Self::key(domain, queue));
    }

    pub fn purge_domain(&self, domain: &str) {
        self.logs.retain(|key, _| key.domain != domain);
    }
}

impl Default for MessageRepository {
    fn default() -> Self {
        Self::new()
    }
}
