//! C1 — Ack Matrix: decides when a persistent message may be deleted.
//!
//! A sparse `message_id -> (group_id -> acked?)` map plus the set of
//! currently active groups (spec §4.1). One writer-priority lock guards
//! the whole structure so mutations are atomic with respect to one
//! another (spec §5); reads (`pending_count`/`pending_ids`) take the same
//! lock in read mode and may proceed concurrently with each other.
//!
//! Grounded on the teacher's `ConsumerGroup` ack-floor bookkeeping
//! (`brokers/stream/group.rs`), generalized from a single per-group floor
//! counter into the cross-group row-release structure the spec requires.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    active_groups: HashSet<String>,
    rows: HashMap<Uuid, HashMap<String, bool>>,
}

pub struct AckMatrix {
    inner: RwLock<Inner>,
}

impl AckMatrix {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Idempotent: registering an already-active group is a no-op.
    pub fn register_group(&self, group_id: &str) {
        self.inner.write().active_groups.insert(group_id.to_string());
    }

    /// Removes `group_id` from the active set. A departed group cannot
    /// block retention, so every tracked row has that group's slot
    /// treated as acked; rows that become fully acked as a result are
    /// dropped and their ids returned.
    pub fn remove_group(&self, group_id: &str) -> Vec<Uuid> {
        let mut inner = self.inner.write();
        inner.active_groups.remove(group_id);

        let active = inner.active_groups.clone();
        let mut released = Vec::new();

        inner.rows.retain(|message_id, row| {
            row.remove(group_id);
            if active.iter().all(|g| row.get(g).copied().unwrap_or(false)) {
                released.push(*message_id);
                false
            } else {
                true
            }
        });

        released
    }

    /// Acknowledge `message_id` on behalf of `group_id`. Fails silently
    /// (returns `false`) if the group is not active — a departed group's
    /// late ack cannot affect retention (invariant 6). Lazily creates the
    /// row on first ack. Returns `true` iff every active group has now
    /// acked, in which case the row is removed.
    pub fn acknowledge(&self, message_id: Uuid, group_id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.active_groups.contains(group_id) {
            return false;
        }

        let active = inner.active_groups.clone();
        let row = inner.rows.entry(message_id).or_default();
        row.insert(group_id.to_string(), true);

        let fully_acked = active.iter().all(|g| row.get(g).copied().unwrap_or(false));
        if fully_acked {
            inner.rows.remove(&message_id);
        }
        fully_acked
    }

    pub fn pending_count(&self, group_id: &str) -> usize {
        let inner = self.inner.read();
        inner
            .rows
            .values()
            .filter(|row| !row.get(group_id).copied().unwrap_or(false))
            .count()
    }

    pub fn pending_ids(&self, group_id: &str) -> Vec<Uuid> {
        let inner = self.inner.read();
        inner
            .rows
            .iter()
            .filter(|(_, row)| !row.get(group_id).copied().unwrap_or(false))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Registers that `message_id` exists in the matrix without any acks
    /// yet, so `pending_count`/`pending_ids` can see it before the first
    /// ack arrives. Called by the repository when a persistent message is
    /// stored (spec §4.2).
    pub fn track(&self, message_id: Uuid) {
        self.inner.write().rows.entry(message_id).or_default();
    }

    pub fn is_active(&self, group_id: &str) -> bool {
        self.inner.read().active_groups.contains(group_id)
    }
}

impl Default for AckMatrix {
    fn default() -> Self {
        Self::new()
    }
}
