//! Local durable persistence for a replica.
//!
//! [`LocalPersistence`] binds a [`Replica`] to a [`CrdtStorage`] backend: opening
//! it replays the stored snapshot and update log into the replica, and from then
//! on every committed update is appended to the log. Write failures never reach
//! the editor; they flip [`PersistenceStatus::available`] and editing continues
//! in memory.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use ts_rs::TS;
use yrs::Subscription;

use super::replica::Replica;
use super::storage::CrdtStorage;
use super::types::UpdateOrigin;
use crate::error::{CoeditError, Result};

/// Observable state of a persistence handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PersistenceStatus {
    /// Stored state has been loaded into the replica.
    pub synced: bool,
    /// The backend accepted the most recent write.
    pub available: bool,
    /// Last write failure, if any.
    pub error: Option<String>,
}

/// Handle keeping a replica mirrored to local storage.
pub struct LocalPersistence {
    doc_id: String,
    storage: Arc<dyn CrdtStorage>,
    status: Arc<watch::Sender<PersistenceStatus>>,
    subscription: Mutex<Option<Subscription>>,
}

impl LocalPersistence {
    /// Open persistence for `replica`, applying any stored state to it.
    ///
    /// # Errors
    ///
    /// - [`CoeditError::Corruption`] if stored state cannot be decoded.
    /// - [`CoeditError::Storage`] (or a backend error) if the backend cannot
    ///   be read at all.
    pub fn open(storage: Arc<dyn CrdtStorage>, replica: &Replica) -> Result<Self> {
        let doc_id = replica.doc_id().to_string();
        let corrupt = |reason: String| CoeditError::Corruption {
            doc_id: doc_id.clone(),
            reason,
        };

        let snapshot = storage.load_doc(&doc_id)?;
        let updates = storage.get_all_updates(&doc_id)?;
        let had_state = snapshot.is_some() || !updates.is_empty();

        if let Some(state) = &snapshot {
            replica
                .apply_update(state, UpdateOrigin::Persistence)
                .map_err(|e| corrupt(format!("snapshot: {}", e)))?;
        }
        for update in &updates {
            replica
                .apply_update(&update.data, UpdateOrigin::Persistence)
                .map_err(|e| corrupt(format!("update {}: {}", update.update_id, e)))?;
        }

        log::debug!(
            "[LocalPersistence] Loaded '{}' (snapshot: {}, {} logged updates)",
            doc_id,
            snapshot.is_some(),
            updates.len()
        );

        let (status, _) = watch::channel(PersistenceStatus {
            synced: true,
            available: true,
            error: None,
        });
        let persistence = Self {
            doc_id,
            storage,
            status: Arc::new(status),
            subscription: Mutex::new(None),
        };

        // Content that exists only in memory (recovered, or edited before the
        // backend was reachable) gets a snapshot right away.
        if !had_state && !replica.is_empty() {
            persistence.flush(replica);
        }

        let subscription = persistence.observe(replica)?;
        *persistence.subscription.lock().unwrap() = Some(subscription);

        Ok(persistence)
    }

    fn observe(&self, replica: &Replica) -> Result<Subscription> {
        let storage = Arc::clone(&self.storage);
        let status = Arc::clone(&self.status);
        let doc_id = self.doc_id.clone();

        replica.observe_updates(move |update, origin| {
            if origin == UpdateOrigin::Persistence {
                return;
            }
            let result = storage.append_update(&doc_id, update, origin);
            record_write(&status, &doc_id, result.map(|_| ()));
        })
    }

    /// Document this handle persists.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Current status.
    pub fn status(&self) -> PersistenceStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<PersistenceStatus> {
        self.status.subscribe()
    }

    /// Write a full snapshot of `replica` and fold the update log into it.
    ///
    /// Failures are reported through the status, like every other write.
    pub fn flush(&self, replica: &Replica) {
        let result = self
            .storage
            .save_doc(&self.doc_id, &replica.encode_state_as_update())
            .and_then(|_| self.storage.compact(&self.doc_id));
        record_write(&self.status, &self.doc_id, result);
    }

    /// Stop mirroring. Stored data is kept.
    pub fn destroy(self) {
        self.subscription.lock().unwrap().take();
        log::debug!("[LocalPersistence] Closed '{}'", self.doc_id);
    }
}

impl std::fmt::Debug for LocalPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPersistence")
            .field("doc_id", &self.doc_id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

fn record_write(status: &watch::Sender<PersistenceStatus>, doc_id: &str, result: Result<()>) {
    match result {
        Ok(()) => {
            status.send_if_modified(|s| {
                let changed = !s.available || s.error.is_some();
                s.available = true;
                s.error = None;
                changed
            });
        }
        Err(e) => {
            log::warn!(
                "[LocalPersistence] Write failed for '{}', continuing in memory: {}",
                doc_id,
                e
            );
            status.send_modify(|s| {
                s.available = false;
                s.error = Some(e.to_string());
            });
        }
    }
}
