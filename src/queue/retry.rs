//! Retry pipeline (spec §4.3): on handler failure the message is wrapped
//! with its attempt count and a computed backoff, and placed on a delay
//! queue. After `max_retries` the entry is dropped and surfaced as a
//! terminal failure event — the core does not dead-letter it itself.
//!
//! Grounded on the teacher's scheduled-wakeup pattern in
//! `brokers/queues/actor.rs` (`next_timeout`/`sleep_until` over a
//! `BTreeMap<timestamp, …>`), adapted from a single timestamp bucket per
//! message to a min-heap of `(next_retry_at, entry)` since retry delay
//! varies per attempt rather than being one fixed visibility timeout.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RetryDefaults;
use crate::message::Message;

pub struct RetryEntry {
    pub message: Message,
    pub attempt: u32,
    pub subscriber_id: u64,
}

struct Scheduled {
    next_retry_at: Instant,
    entry: RetryEntry,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.next_retry_at == other.next_retry_at
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_retry_at.cmp(&other.next_retry_at)
    }
}

pub struct RetryScheduler {
    enabled: bool,
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    max_retries: u32,
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
}

impl RetryScheduler {
    pub fn new(cfg: &RetryDefaults) -> Self {
        Self {
            enabled: cfg.enabled,
            initial_delay: cfg.initial_delay,
            max_delay: cfg.max_delay,
            factor: cfg.factor,
            max_retries: cfg.max_retries,
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Queue `message` for redelivery after a handler failure. Returns
    /// `None` if retry is disabled (spec §4.3: "when `retry_enabled`") or
    /// `max_retries` is exhausted — either way the caller should emit a
    /// terminal failure event instead of rescheduling.
    pub fn schedule(&self, message: Message, attempt: u32, subscriber_id: u64) -> Option<()> {
        if !self.enabled || attempt >= self.max_retries {
            return None;
        }
        let delay = self.delay_for(attempt);
        self.heap.lock().push(Reverse(Scheduled {
            next_retry_at: Instant::now() + delay,
            entry: RetryEntry {
                message,
                attempt: attempt + 1,
                subscriber_id,
            },
        }));
        Some(())
    }

    /// Pops every entry whose `next_retry_at` has elapsed.
    pub fn drain_due(&self) -> Vec<RetryEntry> {
        let mut heap = self.heap.lock();
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse(top)) = heap.peek() {
            if top.next_retry_at > now {
                break;
            }
            due.push(heap.pop().unwrap().0.entry);
        }
        due
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(s)| s.next_retry_at)
    }

    /// How long until the next entry is due, relative to now. `None` if
    /// nothing is scheduled.
    pub fn next_wakeup_duration(&self) -> Option<Duration> {
        self.next_wakeup()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
