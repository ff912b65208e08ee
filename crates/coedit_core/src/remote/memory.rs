//! In-process remote store.
//!
//! [`MemoryRemoteStore`] keeps one server-side replica per document and fans
//! every accepted write out to live subscribers. It also lets tests take the
//! network away, fail or reject writes, and edit documents "from another
//! client", which is how the reconnect and conflict paths are exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::StreamExt;
use tokio::sync::mpsc;
use yrs::StateVector;
use yrs::updates::decoder::Decode;

use super::{
    ApplyUpdateResult, BatchApplyResult, BoxFuture, RecoverySnapshot, RemoteState, RemoteStore,
    StateStream,
};
use crate::crdt::{Replica, UpdateOrigin};
use crate::error::{CoeditError, Result};

/// In-memory [`RemoteStore`]. Clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: Mutex<HashMap<String, ServerDoc>>,
    recovery: Mutex<HashMap<String, RecoverySnapshot>>,
    unreachable: AtomicBool,
    fail_next_writes: AtomicUsize,
    reject_next_writes: AtomicUsize,
    write_latency_ms: AtomicU64,
    submissions: Mutex<Vec<Submission>>,
}

struct ServerDoc {
    replica: Replica,
    updated_at: i64,
    subscribers: Vec<mpsc::UnboundedSender<RemoteState>>,
}

/// A write received by the store, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Target document
    pub doc_id: String,
    /// Submitting client
    pub client_id: String,
    /// Number of updates in the submission (1 for `apply_update`)
    pub update_count: usize,
}

impl MemoryRemoteStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the network. While unreachable every
    /// call fails with [`CoeditError::Network`].
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` writes with a network error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.fail_next_writes.store(count, Ordering::SeqCst);
    }

    /// Answer the next `count` writes with `accepted: false`.
    pub fn reject_next_writes(&self, count: usize) {
        self.inner.reject_next_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every write by `latency` before it reaches the server replica.
    pub fn set_write_latency(&self, latency: Duration) {
        self.inner
            .write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Override what `get_recovery_snapshot` returns for a document.
    pub fn set_recovery_snapshot(&self, doc_id: &str, snapshot: RecoverySnapshot) {
        self.inner
            .recovery
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), snapshot);
    }

    /// Edit a document as another client would, notifying subscribers.
    ///
    /// Creates the document if needed.
    pub fn edit<F>(&self, doc_id: &str, edit: F)
    where
        F: FnOnce(&Replica),
    {
        let mut docs = self.inner.docs.lock().unwrap();
        let doc = docs
            .entry(doc_id.to_string())
            .or_insert_with(|| ServerDoc::new(doc_id));
        edit(&doc.replica);
        doc.commit();
    }

    /// Current server-side text of a document.
    pub fn text(&self, doc_id: &str) -> Option<String> {
        let docs = self.inner.docs.lock().unwrap();
        docs.get(doc_id).map(|doc| doc.replica.text())
    }

    /// Every write received so far, oldest first.
    pub fn submissions(&self) -> Vec<Submission> {
        self.inner.submissions.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            Err(CoeditError::Network("remote unreachable".into()))
        } else {
            Ok(())
        }
    }

    async fn write_latency(&self) {
        let ms = self.inner.write_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Consume one unit of injected write failure. `Ok(false)` means reject.
    fn check_write(&self) -> Result<bool> {
        self.check_reachable()?;
        if take_one(&self.inner.fail_next_writes) {
            return Err(CoeditError::Network("injected write failure".into()));
        }
        Ok(!take_one(&self.inner.reject_next_writes))
    }

    fn record(&self, doc_id: &str, client_id: &str, update_count: usize) {
        self.inner.submissions.lock().unwrap().push(Submission {
            doc_id: doc_id.to_string(),
            client_id: client_id.to_string(),
            update_count,
        });
    }

    fn merge_into(&self, doc_id: &str, updates: &[&[u8]]) -> Result<()> {
        let mut docs = self.inner.docs.lock().unwrap();
        let doc = docs
            .entry(doc_id.to_string())
            .or_insert_with(|| ServerDoc::new(doc_id));
        for update in updates {
            doc.replica.apply_update(update, UpdateOrigin::Remote)?;
        }
        doc.commit();
        Ok(())
    }
}

impl ServerDoc {
    fn new(doc_id: &str) -> Self {
        Self {
            replica: Replica::new(doc_id),
            updated_at: 0,
            subscribers: Vec::new(),
        }
    }

    /// A document exists remotely once it has been written at least once.
    fn is_initialized(&self) -> bool {
        self.updated_at > 0
    }

    fn state(&self) -> RemoteState {
        RemoteState {
            snapshot: self.replica.encode_state_as_update(),
            state_vector: self.replica.encode_state_vector(),
            updated_at: self.updated_at,
        }
    }

    /// Stamp a new strictly increasing timestamp and notify subscribers.
    fn commit(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.updated_at = now.max(self.updated_at + 1);
        let state = self.state();
        self.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
    }

    /// Delta the sender lacks, if the server holds operations beyond `client_sv`.
    fn missing_for(&self, client_sv: &[u8]) -> Result<Option<Vec<u8>>> {
        let client = StateVector::decode_v1(client_sv)
            .map_err(|e| CoeditError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let server = StateVector::decode_v1(&self.replica.encode_state_vector())
            .map_err(|e| CoeditError::Crdt(format!("Failed to decode state vector: {}", e)))?;

        let behind = server
            .iter()
            .any(|(client_id, clock)| client.get(client_id) < *clock);
        if behind {
            Ok(Some(self.replica.encode_diff(client_sv)?))
        } else {
            Ok(None)
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl RemoteStore for MemoryRemoteStore {
    fn get_state<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Result<Option<RemoteState>>> {
        Box::pin(async move {
            self.check_reachable()?;
            let docs = self.inner.docs.lock().unwrap();
            Ok(docs
                .get(doc_id)
                .filter(|doc| doc.is_initialized())
                .map(ServerDoc::state))
        })
    }

    fn subscribe_state<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Result<StateStream>> {
        Box::pin(async move {
            self.check_reachable()?;
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut docs = self.inner.docs.lock().unwrap();
                if let Some(doc) = docs.get_mut(doc_id) {
                    if doc.is_initialized() {
                        let _ = tx.send(doc.state());
                    }
                    doc.subscribers.push(tx);
                } else {
                    let mut doc = ServerDoc::new(doc_id);
                    doc.subscribers.push(tx);
                    docs.insert(doc_id.to_string(), doc);
                }
            }

            let stream = futures_lite::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|state| (state, rx))
            });
            Ok(stream.boxed())
        })
    }

    fn apply_update<'a>(
        &'a self,
        doc_id: &'a str,
        update: &'a [u8],
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<ApplyUpdateResult>> {
        Box::pin(async move {
            self.write_latency().await;
            if !self.check_write()? {
                return Ok(ApplyUpdateResult::default());
            }
            self.record(doc_id, client_id, 1);
            self.merge_into(doc_id, &[update])?;
            Ok(ApplyUpdateResult {
                accepted: true,
                conflict_update: None,
            })
        })
    }

    fn apply_batched_updates<'a>(
        &'a self,
        doc_id: &'a str,
        updates: &'a [Vec<u8>],
        state_vector: &'a [u8],
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<BatchApplyResult>> {
        Box::pin(async move {
            self.write_latency().await;
            if !self.check_write()? {
                return Ok(BatchApplyResult::default());
            }
            self.record(doc_id, client_id, updates.len());

            let conflict_update = {
                let docs = self.inner.docs.lock().unwrap();
                match docs.get(doc_id) {
                    Some(doc) => doc.missing_for(state_vector)?,
                    None => None,
                }
            };

            let refs: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
            self.merge_into(doc_id, &refs)?;

            Ok(BatchApplyResult {
                accepted: true,
                applied_count: updates.len(),
                conflict_update,
            })
        })
    }

    fn initialize_state<'a>(
        &'a self,
        doc_id: &'a str,
        snapshot: &'a [u8],
        _state_vector: &'a [u8],
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.write_latency().await;
            self.check_reachable()?;
            let mut docs = self.inner.docs.lock().unwrap();
            let doc = docs
                .entry(doc_id.to_string())
                .or_insert_with(|| ServerDoc::new(doc_id));
            if doc.is_initialized() {
                return Ok(false);
            }
            doc.replica.apply_update(snapshot, UpdateOrigin::Remote)?;
            doc.commit();
            Ok(true)
        })
    }

    fn get_recovery_snapshot<'a>(
        &'a self,
        doc_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RecoverySnapshot>>> {
        Box::pin(async move {
            self.check_reachable()?;
            if let Some(snapshot) = self.inner.recovery.lock().unwrap().get(doc_id) {
                return Ok(Some(snapshot.clone()));
            }
            let docs = self.inner.docs.lock().unwrap();
            Ok(docs
                .get(doc_id)
                .filter(|doc| doc.is_initialized())
                .map(|doc| RecoverySnapshot {
                    binary_snapshot: Some(doc.replica.encode_state_as_update()),
                    legacy_text: None,
                }))
        })
    }
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let docs = self.inner.docs.lock().unwrap();
        f.debug_struct("MemoryRemoteStore")
            .field("docs", &docs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = MemoryRemoteStore::new();
        let a = Replica::new("doc-1");
        a.set_text("first");
        let b = Replica::new("doc-1");
        b.set_text("second");

        assert!(
            store
                .initialize_state("doc-1", &a.encode_state_as_update(), &a.encode_state_vector())
                .await
                .unwrap()
        );
        assert!(
            !store
                .initialize_state("doc-1", &b.encode_state_as_update(), &b.encode_state_vector())
                .await
                .unwrap()
        );
        assert_eq!(store.text("doc-1").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let store = MemoryRemoteStore::new();
        let client = Replica::new("doc-1");

        let mut last = 0;
        for edit in ["a", "b", "c"] {
            let sv = client.encode_state_vector();
            client.push(edit);
            store
                .apply_update("doc-1", &client.encode_diff(&sv).unwrap(), client.client_id())
                .await
                .unwrap();
            let state = store.get_state("doc-1").await.unwrap().unwrap();
            assert!(state.updated_at > last);
            last = state.updated_at;
        }
        assert_eq!(store.text("doc-1").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_writes() {
        let store = MemoryRemoteStore::new();
        store.edit("doc-1", |r| r.set_text("v1"));

        let mut stream = store.subscribe_state("doc-1").await.unwrap();
        let current = stream.next().await.unwrap();
        let replica = Replica::from_state("doc-1", &current.snapshot, UpdateOrigin::Remote).unwrap();
        assert_eq!(replica.text(), "v1");

        store.edit("doc-1", |r| r.push(" v2"));
        let next = stream.next().await.unwrap();
        assert!(next.updated_at > current.updated_at);
        let replica = Replica::from_state("doc-1", &next.snapshot, UpdateOrigin::Remote).unwrap();
        assert_eq!(replica.text(), "v1 v2");
    }

    #[tokio::test]
    async fn test_batch_reports_missing_remote_changes() {
        let store = MemoryRemoteStore::new();
        let client = Replica::new("doc-1");
        client.set_text("base");
        store
            .initialize_state(
                "doc-1",
                &client.encode_state_as_update(),
                &client.encode_state_vector(),
            )
            .await
            .unwrap();

        store.edit("doc-1", |r| r.push(" remote"));

        let sv = client.encode_state_vector();
        client.insert(0, "local ");
        let update = client.encode_diff(&sv).unwrap();
        let result = store
            .apply_batched_updates(
                "doc-1",
                &[update],
                &client.encode_state_vector(),
                client.client_id(),
            )
            .await
            .unwrap();

        assert!(result.accepted);
        assert_eq!(result.applied_count, 1);
        let conflict = result.conflict_update.unwrap();
        client.apply_update(&conflict, UpdateOrigin::ServerConflict).unwrap();
        assert_eq!(client.text(), store.text("doc-1").unwrap());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryRemoteStore::new();
        let client = Replica::new("doc-1");
        client.set_text("x");
        let update = client.encode_state_as_update();

        store.set_reachable(false);
        assert!(store.get_state("doc-1").await.is_err());
        store.set_reachable(true);

        store.fail_next_writes(1);
        let err = store.apply_update("doc-1", &update, "c").await.unwrap_err();
        assert!(err.is_retryable());

        store.reject_next_writes(1);
        assert!(!store.apply_update("doc-1", &update, "c").await.unwrap().accepted);
        assert!(store.apply_update("doc-1", &update, "c").await.unwrap().accepted);
        assert_eq!(store.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_snapshot_defaults_to_current_state() {
        let store = MemoryRemoteStore::new();
        assert!(store.get_recovery_snapshot("doc-1").await.unwrap().is_none());

        store.edit("doc-1", |r| r.set_text("cloud copy"));
        let snapshot = store.get_recovery_snapshot("doc-1").await.unwrap().unwrap();
        let replica = Replica::from_state(
            "doc-1",
            &snapshot.binary_snapshot.unwrap(),
            UpdateOrigin::Recovery,
        )
        .unwrap();
        assert_eq!(replica.text(), "cloud copy");
    }
}
