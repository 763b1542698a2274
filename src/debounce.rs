//! Generic per-key debounce: stop-and-reset a timer on each event, run the
//! action once the key has been quiet for `delay`.
//!
//! Used by the secure store's `last_used` flush (1s per service account)
//! and the account-request file watcher (2s per path).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub struct DebounceMap<K> {
    delay: Duration,
    timers: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> DebounceMap<K>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Register an event for `key`. Any pending timer for this key is
    /// cancelled and replaced; `action` fires once `delay` elapses without
    /// another call for the same key.
    pub fn fire<F, Fut>(self: &Arc<Self>, key: K, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let this = Arc::clone(self);
        let key_for_task = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.timers.lock().remove(&key_for_task);
            action().await;
        });

        if let Some(old) = self.timers.lock().insert(key, handle) {
            old.abort();
        }
    }

    /// Cancel any pending timer for `key` without firing it.
    pub fn cancel(&self, key: &K) {
        if let Some(old) = self.timers.lock().remove(key) {
            old.abort();
        }
    }
}
