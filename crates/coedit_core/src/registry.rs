//! Shared replica registry.
//!
//! Several consumers (editor views, the sync engine, exporters) may work on the
//! same document at once. [`ReplicaRegistry`] hands all of them the same
//! [`Replica`], reference counted per document id. The first
//! [`get_document`](ReplicaRegistry::get_document) opens local persistence,
//! running cloud recovery if the stored state is corrupted; the last
//! [`release_document`](ReplicaRegistry::release_document) flushes and closes it.
//!
//! The registry is an ordinary value: construct one per storage backend and
//! pass it to whoever needs it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use ts_rs::TS;

use crate::crdt::{CrdtStorage, LocalPersistence, PersistenceStatus, Replica};
use crate::error::Result;
use crate::recovery::{CloudRecovery, RecoverySource};
use crate::scheduler::ScheduledTask;

/// Observable state of a registry entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DocumentStatus {
    /// Stored state has been loaded into the replica
    pub synced: bool,
    /// Local persistence is accepting writes. `false` means memory-only editing.
    pub available: bool,
    /// Last persistence failure
    pub persistence_error: Option<String>,
    /// Set when the document was rebuilt after local corruption
    pub recovered_from: Option<RecoverySource>,
}

/// A consumer's handle on a registered document.
#[derive(Clone)]
pub struct SharedDocument {
    /// The shared replica
    pub replica: Arc<Replica>,
    /// Entry status
    pub status: watch::Receiver<DocumentStatus>,
}

impl SharedDocument {
    /// Document id.
    pub fn doc_id(&self) -> &str {
        self.replica.doc_id()
    }
}

struct Entry {
    replica: Arc<Replica>,
    persistence: Option<LocalPersistence>,
    status: Arc<watch::Sender<DocumentStatus>>,
    ref_count: usize,
    _status_forwarder: Option<ScheduledTask>,
}

impl Entry {
    fn handle(&self) -> SharedDocument {
        SharedDocument {
            replica: Arc::clone(&self.replica),
            status: self.status.subscribe(),
        }
    }
}

/// Reference-counted map of document id to shared replica.
pub struct ReplicaRegistry {
    storage: Option<Arc<dyn CrdtStorage>>,
    recovery: Option<CloudRecovery>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ReplicaRegistry {
    /// Create a registry.
    ///
    /// Without `storage` every document is memory-only. Without `recovery`,
    /// corrupted documents are replaced by a placeholder.
    pub fn new(storage: Option<Arc<dyn CrdtStorage>>, recovery: Option<CloudRecovery>) -> Self {
        Self {
            storage,
            recovery,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the shared document for `doc_id`, loading it on first use.
    ///
    /// Every call must be balanced by a
    /// [`release_document`](Self::release_document).
    pub async fn get_document(&self, doc_id: &str) -> Result<SharedDocument> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(doc_id) {
            entry.ref_count += 1;
            log::debug!(
                "[ReplicaRegistry] '{}' now has {} references",
                doc_id,
                entry.ref_count
            );
            return Ok(entry.handle());
        }

        let entry = self.open_entry(doc_id).await?;
        let handle = entry.handle();
        entries.insert(doc_id.to_string(), entry);
        Ok(handle)
    }

    /// Drop one reference. At zero the replica is flushed, persistence is
    /// closed and the entry removed.
    ///
    /// Returns `true` if this released the last reference.
    pub async fn release_document(&self, doc_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(doc_id) else {
            log::warn!("[ReplicaRegistry] Release of unknown document '{}'", doc_id);
            return false;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return false;
        }

        if let Some(entry) = entries.remove(doc_id) {
            if let Some(persistence) = entry.persistence {
                persistence.flush(&entry.replica);
                persistence.destroy();
            }
            log::info!("[ReplicaRegistry] Unloaded '{}'", doc_id);
        }
        true
    }

    /// Current reference count of `doc_id` (0 if not loaded).
    pub async fn ref_count(&self, doc_id: &str) -> usize {
        let entries = self.entries.lock().await;
        entries.get(doc_id).map_or(0, |entry| entry.ref_count)
    }

    /// Whether `doc_id` is loaded.
    pub async fn is_loaded(&self, doc_id: &str) -> bool {
        self.entries.lock().await.contains_key(doc_id)
    }

    /// Ids of all loaded documents, sorted.
    pub async fn loaded_documents(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn open_entry(&self, doc_id: &str) -> Result<Entry> {
        let mut replica = Replica::new(doc_id);
        let mut status = DocumentStatus::default();

        let persistence = match &self.storage {
            None => None,
            Some(storage) => match LocalPersistence::open(Arc::clone(storage), &replica) {
                Ok(persistence) => Some(persistence),
                Err(e) if e.is_corruption() => {
                    log::warn!("[ReplicaRegistry] {}, recovering", e);
                    // Discard whatever was applied before the failure
                    replica = Replica::new(doc_id);
                    let source = match &self.recovery {
                        Some(recovery) => recovery.recover_into(&replica).await?,
                        None => {
                            CloudRecovery::merge_into(&replica, CloudRecovery::placeholder(doc_id))?
                        }
                    };
                    status.recovered_from = Some(source);

                    if let Err(e) = storage.delete_doc(doc_id) {
                        log::warn!(
                            "[ReplicaRegistry] Could not discard corrupted state of '{}': {}",
                            doc_id,
                            e
                        );
                    }
                    match LocalPersistence::open(Arc::clone(storage), &replica) {
                        Ok(persistence) => Some(persistence),
                        Err(e) => {
                            log::warn!(
                                "[ReplicaRegistry] '{}' is memory-only after recovery: {}",
                                doc_id,
                                e
                            );
                            status.persistence_error = Some(e.to_string());
                            None
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[ReplicaRegistry] '{}' is memory-only: {}", doc_id, e);
                    status.persistence_error = Some(e.to_string());
                    None
                }
            },
        };

        if let Some(persistence) = &persistence {
            let persisted = persistence.status();
            status.synced = persisted.synced;
            status.available = persisted.available;
            status.persistence_error = persisted.error;
        }

        let (status, _) = watch::channel(status);
        let status = Arc::new(status);
        let forwarder = persistence
            .as_ref()
            .map(|p| forward_persistence_status(p.subscribe(), Arc::clone(&status)));

        log::info!(
            "[ReplicaRegistry] Loaded '{}' ({})",
            doc_id,
            if persistence.is_some() { "persisted" } else { "memory-only" }
        );

        Ok(Entry {
            replica: Arc::new(replica),
            persistence,
            status,
            ref_count: 1,
            _status_forwarder: forwarder,
        })
    }
}

fn forward_persistence_status(
    mut persistence: watch::Receiver<PersistenceStatus>,
    status: Arc<watch::Sender<DocumentStatus>>,
) -> ScheduledTask {
    ScheduledTask::spawn(async move {
        while persistence.changed().await.is_ok() {
            let latest = persistence.borrow_and_update().clone();
            status.send_modify(|s| {
                s.synced = latest.synced;
                s.available = latest.available;
                s.persistence_error = latest.error;
            });
        }
    })
}

impl std::fmt::Debug for ReplicaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRegistry")
            .field("persistent", &self.storage.is_some())
            .field("recovery", &self.recovery.is_some())
            .finish_non_exhaustive()
    }
}
