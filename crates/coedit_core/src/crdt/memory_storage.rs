//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`CrdtStorage`]
//! for use in unit tests, demos, and as the memory-only fallback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::storage::{CrdtStorage, StorageResult, fold_updates};
use super::types::{CrdtUpdate, UpdateOrigin};
use crate::error::CoeditError;

/// In-memory CRDT storage.
///
/// This implementation stores all data in memory using `HashMap` and `Vec`.
/// It's thread-safe via `RwLock` but data is lost when dropped. Clones share
/// the same underlying maps, so a test can keep a handle and inspect what a
/// component persisted.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Update logs (name -> list of updates)
    updates: Arc<RwLock<HashMap<String, Vec<CrdtUpdate>>>>,

    /// Serialized offline queues (name -> JSON)
    queues: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Counter for generating update IDs
    next_id: Arc<RwLock<i64>>,

    /// When set, every write fails with this message
    fail_writes: Arc<RwLock<Option<String>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating an unavailable backend
    /// (quota exceeded, private browsing). Pass `None` to restore writes.
    pub fn set_fail_writes(&self, reason: Option<&str>) {
        *self.fail_writes.write().unwrap() = reason.map(str::to_string);
    }

    fn check_writable(&self) -> StorageResult<()> {
        match self.fail_writes.read().unwrap().as_ref() {
            Some(reason) => Err(CoeditError::Storage(reason.clone())),
            None => Ok(()),
        }
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        let mut docs = self.docs.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();
        let mut queues = self.queues.write().unwrap();
        docs.remove(name);
        updates.remove(name);
        queues.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap();
        let updates = self.updates.read().unwrap();
        let mut names: Vec<String> = docs.keys().chain(updates.keys()).cloned().collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn append_update(
        &self,
        name: &str,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<i64> {
        self.check_writable()?;
        let id = self.next_update_id();
        let stored = CrdtUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap();
        updates.entry(name.to_string()).or_default().push(stored);

        Ok(id)
    }

    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>> {
        let updates = self.updates.read().unwrap();
        Ok(updates.get(name).cloned().unwrap_or_default())
    }

    fn compact(&self, name: &str) -> StorageResult<()> {
        self.check_writable()?;
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();

        let log = updates.remove(name).unwrap_or_default();
        if let Some(merged) = fold_updates(docs.get(name).cloned(), &log)? {
            docs.insert(name.to_string(), merged);
        }

        Ok(())
    }

    fn save_offline_queue(&self, name: &str, queue: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        let mut queues = self.queues.write().unwrap();
        queues.insert(name.to_string(), queue.to_vec());
        Ok(())
    }

    fn load_offline_queue(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let queues = self.queues.read().unwrap();
        Ok(queues.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Replica;

    #[test]
    fn test_save_and_load_doc() {
        let storage = MemoryStorage::new();
        let data = b"test document state";

        storage.save_doc("test", data).unwrap();
        let loaded = storage.load_doc("test").unwrap();

        assert_eq!(loaded, Some(data.to_vec()));
    }

    #[test]
    fn test_load_nonexistent_doc() {
        let storage = MemoryStorage::new();
        let loaded = storage.load_doc("nonexistent").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_delete_doc() {
        let storage = MemoryStorage::new();
        storage.save_doc("test", b"data").unwrap();
        storage
            .append_update("test", b"update", UpdateOrigin::Local)
            .unwrap();
        storage.save_offline_queue("test", b"[]").unwrap();

        storage.delete_doc("test").unwrap();

        assert!(storage.load_doc("test").unwrap().is_none());
        assert!(storage.get_all_updates("test").unwrap().is_empty());
        assert!(storage.load_offline_queue("test").unwrap().is_none());
    }

    #[test]
    fn test_list_docs() {
        let storage = MemoryStorage::new();
        storage.save_doc("doc1", b"data1").unwrap();
        storage.save_doc("doc2", b"data2").unwrap();
        storage
            .append_update("doc3", b"update", UpdateOrigin::Local)
            .unwrap();

        assert_eq!(storage.list_docs().unwrap(), vec!["doc1", "doc2", "doc3"]);
    }

    #[test]
    fn test_append_and_get_updates() {
        let storage = MemoryStorage::new();

        let id1 = storage
            .append_update("test", b"update1", UpdateOrigin::Local)
            .unwrap();
        let id2 = storage
            .append_update("test", b"update2", UpdateOrigin::ServerSubscription)
            .unwrap();

        assert!(id1 < id2);

        let all = storage.get_all_updates("test").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].origin, UpdateOrigin::Local);
        assert_eq!(all[1].origin, UpdateOrigin::ServerSubscription);
        assert_eq!(all[1].doc_name, "test");
    }

    #[test]
    fn test_compact_folds_log_into_snapshot() {
        let storage = MemoryStorage::new();
        let replica = Replica::new("test");

        replica.set_text("base");
        storage
            .save_doc("test", &replica.encode_state_as_update())
            .unwrap();
        for edit in [" one", " two", " three"] {
            let sv = replica.encode_state_vector();
            replica.push(edit);
            storage
                .append_update("test", &replica.encode_diff(&sv).unwrap(), UpdateOrigin::Local)
                .unwrap();
        }

        storage.compact("test").unwrap();

        assert!(storage.get_all_updates("test").unwrap().is_empty());
        let snapshot = storage.load_doc("test").unwrap().unwrap();
        let restored = Replica::from_state("test", &snapshot, UpdateOrigin::Persistence).unwrap();
        assert_eq!(restored.text(), "base one two three");
    }

    #[test]
    fn test_failed_writes() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(Some("quota exceeded"));

        let err = storage.save_doc("test", b"data").unwrap_err();
        assert!(matches!(err, CoeditError::Storage(_)));
        assert!(storage.save_offline_queue("test", b"[]").is_err());

        storage.set_fail_writes(None);
        storage.save_doc("test", b"data").unwrap();
    }
}
