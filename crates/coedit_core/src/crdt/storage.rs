//! Storage abstraction for CRDT persistence.
//!
//! This module defines the [`CrdtStorage`] trait which abstracts over different
//! storage backends (SQLite, in-memory) for persisting replica state, the
//! incremental update log and the offline operation queue.

use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::CoeditError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, CoeditError>;

/// Trait for CRDT document storage backends.
///
/// Implementations of this trait handle persisting replica state to various
/// storage backends (SQLite for native, memory for tests and for browsers
/// without durable storage).
///
/// # Storage Model
///
/// The storage maintains three kinds of data per document:
/// 1. **Document snapshot**: compacted full state of the replica
/// 2. **Update log**: incremental updates appended since the last compaction
/// 3. **Offline queue**: the serialized pending operations of the offline queue
///
/// Opening a replica applies the snapshot and then every logged update.
pub trait CrdtStorage: Send + Sync {
    /// Load the full document state as a binary blob.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state.
    ///
    /// This overwrites any existing state for the document.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document, its updates and its offline queue.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> StorageResult<Vec<String>>;

    /// Append an incremental update to the update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin)
    -> StorageResult<i64>;

    /// Get all logged updates for a document, oldest first.
    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>>;

    /// Fold the update log into the document snapshot.
    ///
    /// After compaction the snapshot alone reproduces the same replica state
    /// and the update log is empty.
    fn compact(&self, name: &str) -> StorageResult<()>;

    /// Persist the serialized offline queue for a document, replacing any
    /// previously stored queue.
    fn save_offline_queue(&self, name: &str, queue: &[u8]) -> StorageResult<()>;

    /// Load the serialized offline queue for a document.
    fn load_offline_queue(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;
}

/// Merge a snapshot and an update log into one snapshot.
pub(crate) fn fold_updates(
    snapshot: Option<Vec<u8>>,
    updates: &[CrdtUpdate],
) -> StorageResult<Option<Vec<u8>>> {
    if updates.is_empty() {
        return Ok(snapshot);
    }

    let mut parts = Vec::with_capacity(updates.len() + 1);
    parts.extend(snapshot);
    parts.extend(updates.iter().map(|u| u.data.clone()));
    super::update::merge_updates(&parts).map(Some)
}
