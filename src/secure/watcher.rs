//! Account-request file watcher (spec §4.7): filters create/write events
//! on the external requests file, debounces them (2s per path, via the
//! shared `DebounceMap`), and reconciles the file's contents against the
//! in-memory request store — enqueuing newly-seen pending requests onto
//! `SYSTEM/_account_requests` for administrative attention. Deletions
//! and renames are ignored; chmod (a metadata-only modify) is ignored.
//!
//! Grounded on `zhubby-moltis`'s `ImportWatcher`
//! (`crates/openclaw-import/src/watcher.rs`) for the overall shape
//! (watch a directory, filter by event kind, debounce, reconcile) —
//! adapted from `notify-debouncer-full` to the plain `notify` crate plus
//! this crate's own `DebounceMap`, since the teacher repo has no
//! file-watching surface at all and `ImportWatcher`'s debounced crate
//! isn't part of this crate's dependency stack.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::debounce::DebounceMap;
use crate::message::Message;
use crate::queue::QueueHandle;
use crate::secure::account_requests::{AccountRequestStore, IncomingRequest};
use crate::supervisor::Supervisor;

/// Keeps the underlying OS watch alive; drop to stop watching.
pub struct AccountRequestWatcher {
    _inner: RecommendedWatcher,
}

impl AccountRequestWatcher {
    pub fn start(
        requests_file: PathBuf,
        store: Arc<AccountRequestStore>,
        notify_queue: QueueHandle,
        debounce: Duration,
        supervisor: Arc<Supervisor>,
    ) -> notify::Result<Self> {
        let debounced = Arc::new(DebounceMap::new(debounce));
        let watch_target = requests_file.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            if !is_relevant(&event.kind) {
                return;
            }
            if !event.paths.iter().any(|p| p == &watch_target) {
                return;
            }

            let store = Arc::clone(&store);
            let queue = notify_queue.clone();
            let supervisor = Arc::clone(&supervisor);
            let path = watch_target.clone();
            debounced.fire(path.clone(), move || async move {
                reconcile(&path, &store, &queue, &supervisor).await;
            });
        })?;

        if let Some(parent) = requests_file.parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        Ok(Self { _inner: watcher })
    }
}

/// Create/write events only — renames, removals and metadata-only
/// modifies (chmod) are ignored (spec §4.7).
fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Reads the requests file, skips any username with an existing pending
/// request, and submits the rest — publishing one notification message
/// per newly-created request onto the caller-supplied queue handle
/// (expected to be `SYSTEM/_account_requests`).
async fn reconcile(path: &Path, store: &AccountRequestStore, queue: &QueueHandle, supervisor: &Supervisor) {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            supervisor.emit_background_failure("account_request_watcher", format!("read failed: {e}"));
            return;
        }
    };
    let incoming: Vec<IncomingRequest> = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            supervisor.emit_background_failure("account_request_watcher", format!("malformed requests file: {e}"));
            return;
        }
    };

    for request in incoming {
        if store.has_pending_for(&request.username) {
            debug!(username = %request.username, "account request already pending, skipping");
            continue;
        }
        match store.submit(&request) {
            Ok(created) => {
                let payload = serde_json::json!({
                    "request_id": created.id,
                    "username": created.username,
                })
                .to_string();
                let mut headers = HashMap::new();
                headers.insert("Content-Type".to_string(), "application/json".to_string());
                let message = Message::new("account_request", Bytes::from(payload)).with_headers(headers);
                if let Err(e) = queue.enqueue(message).await {
                    warn!(error = %e, "failed to enqueue account request notification");
                }
            }
            Err(e) => supervisor.emit_background_failure("account_request_watcher", e.to_string()),
        }
    }
}
