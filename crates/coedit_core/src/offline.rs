//! Offline operation queue.
//!
//! While the connection is down, every local delta is wrapped in an
//! [`OfflineOperation`] and queued, in memory and (best effort) in the
//! [`CrdtStorage`] backend so the queue survives a restart. On reconnect,
//! [`OfflineQueue::reconcile`] compares the local and remote states:
//!
//! - remote ahead only: the remote state is pulled in, then the queue is replayed;
//! - local ahead only: the queue is replayed in order;
//! - both ahead: the queue enters [`OfflineMode::Conflict`] and waits for
//!   [`OfflineQueue::resolve`], unless `auto_resolve_conflicts` is set.
//!
//! The queue is bounded by `max_offline_operations`. Past it the oldest
//! operation is dropped; its content is still in the replica, so the next
//! reconcile pushes a catch-up diff instead.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;

use crate::config::OfflineConfig;
use crate::crdt::{CrdtStorage, Replica, UpdateOrigin, compare_states};
use crate::error::{CoeditError, Result};
use crate::remote::{RemoteState, RemoteStore};

/// Sync mode of a document, as seen by the offline queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum OfflineMode {
    /// Connected; local changes go straight to the batcher
    #[default]
    Online,
    /// Disconnected; local changes are queued
    Offline,
    /// Reconciling after a reconnect
    Syncing,
    /// Local and remote diverged; waiting for a resolution strategy
    Conflict,
}

/// How to settle a divergence between the local and remote copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ConflictStrategy {
    /// Keep the local text
    LocalWins,
    /// Keep the remote text
    RemoteWins,
    /// CRDT-merge both sides
    #[default]
    Merge,
}

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A CRDT delta
    Update,
}

/// A local change made while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineOperation {
    /// `"{timestamp}-{random}"`
    pub id: String,
    /// Operation kind
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Unix timestamp (milliseconds) when the change was made
    pub timestamp: i64,
    /// Encoded CRDT delta
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Sent and acknowledged by the remote
    #[serde(default)]
    pub applied: bool,
}

impl OfflineOperation {
    /// Wrap a delta as a new operation.
    pub fn update(payload: Vec<u8>) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}", timestamp, &random[..8]),
            kind: OperationKind::Update,
            timestamp,
            payload,
            applied: false,
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Result of a successful [`OfflineQueue::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The remote had no state; this replica's state became the initial one
    Initialized,
    /// Queued operations were sent in order
    Replayed {
        /// Number of operations sent
        operations: usize,
        /// The remote was ahead and its state was applied first
        pulled_remote: bool,
    },
    /// Both sides changed; nothing was sent
    Conflict,
    /// Both sides changed and were merged automatically
    AutoResolved,
}

/// Bounded, persisted queue of offline operations for one document.
pub struct OfflineQueue {
    doc_id: String,
    config: OfflineConfig,
    storage: Option<Arc<dyn CrdtStorage>>,
    mode: watch::Sender<OfflineMode>,
    state: Mutex<QueueState>,
}

struct Checkpoint {
    ids: HashSet<String>,
    evicted: usize,
}

#[derive(Default)]
struct QueueState {
    operations: VecDeque<OfflineOperation>,
    /// Operations dropped to honor the bound since the last reconcile
    evicted: usize,
    last_persist_error: Option<String>,
}

impl OfflineQueue {
    /// Create an empty queue. Without `storage` the queue is memory-only.
    pub fn new(
        doc_id: impl Into<String>,
        config: OfflineConfig,
        storage: Option<Arc<dyn CrdtStorage>>,
    ) -> Self {
        let (mode, _) = watch::channel(OfflineMode::Online);
        Self {
            doc_id: doc_id.into(),
            config,
            storage,
            mode,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Document this queue belongs to.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Whether offline queueing is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current mode.
    pub fn mode(&self) -> OfflineMode {
        *self.mode.borrow()
    }

    /// Watch mode changes.
    pub fn subscribe(&self) -> watch::Receiver<OfflineMode> {
        self.mode.subscribe()
    }

    /// Switch mode. Returns `true` if it changed.
    pub fn set_mode(&self, mode: OfflineMode) -> bool {
        let changed = self.mode.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            log::info!("[OfflineQueue] '{}' is now {:?}", self.doc_id, mode);
        }
        changed
    }

    /// Queue a local delta. Returns `false` if queueing is disabled.
    pub fn record(&self, update: Vec<u8>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        while state.operations.len() >= self.config.max_offline_operations {
            if let Some(dropped) = state.operations.pop_front() {
                state.evicted += 1;
                log::warn!(
                    "[OfflineQueue] Queue for '{}' is full, dropping oldest operation {}",
                    self.doc_id,
                    dropped.id
                );
            } else {
                break;
            }
        }
        let operation = OfflineOperation::update(update);
        log::debug!("[OfflineQueue] Queued {} for '{}'", operation.id, self.doc_id);
        state.operations.push_back(operation);
        self.persist(&mut state);
        true
    }

    /// Reload operations persisted by a previous session.
    ///
    /// Returns how many unapplied operations were restored.
    pub fn restore(&self) -> Result<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let Some(bytes) = storage.load_offline_queue(&self.doc_id)? else {
            return Ok(0);
        };
        let operations: Vec<OfflineOperation> = serde_json::from_slice(&bytes)?;
        let mut state = self.state.lock().unwrap();
        state.operations = operations.into_iter().filter(|op| !op.applied).collect();
        let restored = state.operations.len();
        if restored > 0 {
            log::info!(
                "[OfflineQueue] Restored {} pending operations for '{}'",
                restored,
                self.doc_id
            );
        }
        Ok(restored)
    }

    /// Operations not yet acknowledged, oldest first.
    pub fn pending_operations(&self) -> Vec<OfflineOperation> {
        let state = self.state.lock().unwrap();
        state.operations.iter().cloned().collect()
    }

    /// Number of operations not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Whether any offline change has not reached the remote.
    pub fn has_unsynced_changes(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.operations.is_empty() || state.evicted > 0
    }

    /// Last failure to mirror the queue to storage.
    pub fn last_persist_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_persist_error.clone()
    }

    /// Bring the remote up to date after a reconnect.
    ///
    /// On error the mode returns to [`OfflineMode::Offline`] and unsent
    /// operations stay queued.
    pub async fn reconcile(
        &self,
        replica: &Replica,
        remote: &dyn RemoteStore,
    ) -> Result<ReconcileOutcome> {
        self.set_mode(OfflineMode::Syncing);
        match self.reconcile_inner(replica, remote).await {
            Ok(outcome) => {
                if outcome != ReconcileOutcome::Conflict {
                    self.set_mode(OfflineMode::Online);
                }
                Ok(outcome)
            }
            Err(e) => {
                log::warn!("[OfflineQueue] Reconcile of '{}' failed: {}", self.doc_id, e);
                self.set_mode(OfflineMode::Offline);
                Err(e)
            }
        }
    }

    async fn reconcile_inner(
        &self,
        replica: &Replica,
        remote: &dyn RemoteStore,
    ) -> Result<ReconcileOutcome> {
        let remote_state = match remote.get_state(&self.doc_id).await? {
            Some(state) => state,
            None => {
                let covered = self.checkpoint();
                let state_vector = replica.encode_state_vector();
                let created = remote
                    .initialize_state(&self.doc_id, &replica.encode_state_as_update(), &state_vector)
                    .await?;
                if created {
                    log::info!("[OfflineQueue] Initialized remote state for '{}'", self.doc_id);
                    self.prune(covered);
                    self.finish(replica, remote, &state_vector).await?;
                    return Ok(ReconcileOutcome::Initialized);
                }
                // Another client initialized first
                remote
                    .get_state(&self.doc_id)
                    .await?
                    .ok_or_else(|| CoeditError::NotInitialized(self.doc_id.clone()))?
            }
        };

        let divergence = compare_states(&replica.encode_state_as_update(), &remote_state.snapshot)?;
        if divergence.is_conflict() {
            if !self.config.auto_resolve_conflicts {
                log::warn!(
                    "[OfflineQueue] '{}' diverged from the remote copy, waiting for resolution",
                    self.doc_id
                );
                self.set_mode(OfflineMode::Conflict);
                return Ok(ReconcileOutcome::Conflict);
            }
            log::info!("[OfflineQueue] Auto-merging diverged '{}'", self.doc_id);
            self.settle(replica, remote, &remote_state, ConflictStrategy::Merge)
                .await?;
            return Ok(ReconcileOutcome::AutoResolved);
        }

        let pulled_remote = divergence.remote_ahead;
        if pulled_remote {
            replica.apply_update(&remote_state.snapshot, UpdateOrigin::ServerResync)?;
        }

        let operations = self.finish(replica, remote, &remote_state.state_vector).await?;
        Ok(ReconcileOutcome::Replayed {
            operations,
            pulled_remote,
        })
    }

    /// Replay whatever is queued, then cover evicted operations with a diff
    /// against `base_state_vector`, which the remote is known to hold.
    async fn finish(
        &self,
        replica: &Replica,
        remote: &dyn RemoteStore,
        base_state_vector: &[u8],
    ) -> Result<usize> {
        let operations = self.replay(replica, remote).await?;

        if self.take_evicted() > 0 {
            let catch_up = replica.encode_diff(base_state_vector)?;
            log::info!(
                "[OfflineQueue] Pushing catch-up diff for '{}' ({} bytes)",
                self.doc_id,
                catch_up.len()
            );
            self.push(replica, remote, &catch_up).await?;
        }
        Ok(operations)
    }

    /// Send queued operations in order, pruning each once acknowledged.
    async fn replay(&self, replica: &Replica, remote: &dyn RemoteStore) -> Result<usize> {
        let mut sent = 0;
        // Operations recorded during the replay are picked up by the next pass
        loop {
            let batch = self.pending_operations();
            if batch.is_empty() {
                break;
            }
            for operation in batch {
                self.push(replica, remote, &operation.payload).await?;
                self.mark_applied(&operation.id);
                sent += 1;
            }
        }
        if sent > 0 {
            log::info!("[OfflineQueue] Replayed {} operations for '{}'", sent, self.doc_id);
        }
        Ok(sent)
    }

    async fn push(&self, replica: &Replica, remote: &dyn RemoteStore, update: &[u8]) -> Result<()> {
        let result = remote
            .apply_update(&self.doc_id, update, replica.client_id())
            .await?;
        if !result.accepted {
            return Err(CoeditError::Rejected(self.doc_id.clone()));
        }
        if let Some(missing) = result.conflict_update {
            replica.apply_update(&missing, UpdateOrigin::ServerConflict)?;
        }
        Ok(())
    }

    /// Settle a [`OfflineMode::Conflict`] with `strategy`.
    ///
    /// # Errors
    ///
    /// [`CoeditError::NotInitialized`] if the remote has no state; otherwise
    /// remote store errors. The mode stays `Conflict` on failure.
    pub async fn resolve(
        &self,
        strategy: ConflictStrategy,
        replica: &Replica,
        remote: &dyn RemoteStore,
    ) -> Result<()> {
        let remote_state = remote
            .get_state(&self.doc_id)
            .await?
            .ok_or_else(|| CoeditError::NotInitialized(self.doc_id.clone()))?;
        self.settle(replica, remote, &remote_state, strategy).await?;
        self.set_mode(OfflineMode::Online);
        Ok(())
    }

    async fn settle(
        &self,
        replica: &Replica,
        remote: &dyn RemoteStore,
        remote_state: &RemoteState,
        strategy: ConflictStrategy,
    ) -> Result<()> {
        let winner = match strategy {
            ConflictStrategy::Merge => None,
            ConflictStrategy::LocalWins => Some(replica.text()),
            ConflictStrategy::RemoteWins => Some(
                Replica::from_state(&self.doc_id, &remote_state.snapshot, UpdateOrigin::Remote)?
                    .text(),
            ),
        };

        replica.apply_update(&remote_state.snapshot, UpdateOrigin::ServerConflict)?;
        if let Some(text) = winner {
            replica.set_text_with_origin(&text, UpdateOrigin::ServerConflict);
        }

        // Operations recorded while the diff is in flight are not covered by it
        let covered = self.checkpoint();
        let diff = replica.encode_diff(&remote_state.state_vector)?;
        self.push(replica, remote, &diff).await?;
        self.prune(covered);
        self.finish(replica, remote, &remote_state.state_vector).await?;
        log::info!(
            "[OfflineQueue] Resolved '{}' with {:?}",
            self.doc_id,
            strategy
        );
        Ok(())
    }

    fn mark_applied(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(operation) = state.operations.iter_mut().find(|op| op.id == id) {
            operation.applied = true;
        }
        state.operations.retain(|op| !op.applied);
        self.persist(&mut state);
    }

    fn take_evicted(&self) -> usize {
        std::mem::take(&mut self.state.lock().unwrap().evicted)
    }

    /// Snapshot of what the replica's current state already contains.
    fn checkpoint(&self) -> Checkpoint {
        let state = self.state.lock().unwrap();
        Checkpoint {
            ids: state.operations.iter().map(|op| op.id.clone()).collect(),
            evicted: state.evicted,
        }
    }

    /// Drop the operations in `covered` once the remote holds them.
    fn prune(&self, covered: Checkpoint) {
        let mut state = self.state.lock().unwrap();
        state.operations.retain(|op| !covered.ids.contains(&op.id));
        state.evicted = state.evicted.saturating_sub(covered.evicted);
        self.persist(&mut state);
    }

    fn persist(&self, state: &mut QueueState) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = serde_json::to_vec(&state.operations)
            .map_err(CoeditError::from)
            .and_then(|bytes| storage.save_offline_queue(&self.doc_id, &bytes));
        match result {
            Ok(()) => state.last_persist_error = None,
            Err(e) => {
                log::warn!(
                    "[OfflineQueue] Failed to persist queue for '{}': {}",
                    self.doc_id,
                    e
                );
                state.last_persist_error = Some(e.to_string());
            }
        }
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("doc_id", &self.doc_id)
            .field("mode", &self.mode())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crdt::MemoryStorage;
    use crate::remote::MemoryRemoteStore;

    fn config(max: usize) -> OfflineConfig {
        OfflineConfig {
            enabled: true,
            max_offline_operations: max,
            auto_resolve_conflicts: false,
        }
    }

    /// Edit `replica` and return the delta.
    fn edit(replica: &Replica, text: &str) -> Vec<u8> {
        let sv = replica.encode_state_vector();
        replica.push(text);
        replica.encode_diff(&sv).unwrap()
    }

    /// A replica whose initial state is already on `store`.
    async fn shared_replica(store: &MemoryRemoteStore, text: &str) -> Replica {
        let replica = Replica::new("doc-1");
        replica.set_text(text);
        store
            .initialize_state(
                "doc-1",
                &replica.encode_state_as_update(),
                &replica.encode_state_vector(),
            )
            .await
            .unwrap();
        replica
    }

    #[test]
    fn test_operation_json_shape() {
        let operation = OfflineOperation::update(vec![1, 2, 3]);
        let json = serde_json::to_value(&operation).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["payload"], "AQID");
        assert_eq!(json["applied"], false);

        let (timestamp, random) = operation.id.split_once('-').unwrap();
        assert_eq!(timestamp, operation.timestamp.to_string());
        assert_eq!(random.len(), 8);
    }

    #[test]
    fn test_record_evicts_oldest_past_bound() {
        let queue = OfflineQueue::new("doc-1", config(3), None);
        for i in 0..5u8 {
            assert!(queue.record(vec![i]));
        }
        let payloads: Vec<_> = queue
            .pending_operations()
            .into_iter()
            .map(|op| op.payload)
            .collect();
        assert_eq!(payloads, vec![vec![2], vec![3], vec![4]]);
        assert!(queue.has_unsynced_changes());
    }

    #[test]
    fn test_disabled_queue_records_nothing() {
        let mut disabled = config(10);
        disabled.enabled = false;
        let queue = OfflineQueue::new("doc-1", disabled, None);
        assert!(!queue.record(vec![1]));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_restore_from_storage() {
        let storage: Arc<dyn CrdtStorage> = Arc::new(MemoryStorage::new());
        let queue = OfflineQueue::new("doc-1", config(10), Some(Arc::clone(&storage)));
        queue.record(vec![1]);
        queue.record(vec![2]);

        let reopened = OfflineQueue::new("doc-1", config(10), Some(storage));
        assert_eq!(reopened.restore().unwrap(), 2);
        assert_eq!(reopened.pending_operations(), queue.pending_operations());
    }

    #[test]
    fn test_persist_failure_is_reported_not_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_fail_writes(Some("disk full"));
        let queue = OfflineQueue::new("doc-1", config(10), Some(storage as Arc<dyn CrdtStorage>));

        assert!(queue.record(vec![1]));
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.last_persist_error().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_reconcile_replays_in_order() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.set_mode(OfflineMode::Offline);

        for word in [" one", " two", " three"] {
            queue.record(edit(&replica, word));
        }

        let outcome = queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replayed {
                operations: 3,
                pulled_remote: false
            }
        );
        assert_eq!(store.text("doc-1").unwrap(), "base one two three");
        assert_eq!(queue.mode(), OfflineMode::Online);
        assert!(!queue.has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_reconcile_pulls_remote_when_only_remote_changed() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        store.edit("doc-1", |server| server.push(" remote"));
        let queue = OfflineQueue::new("doc-1", config(10), None);

        let outcome = queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Replayed {
                operations: 0,
                pulled_remote: true
            }
        );
        assert_eq!(replica.text(), "base remote");
    }

    #[tokio::test]
    async fn test_reconcile_initializes_missing_remote() {
        let store = MemoryRemoteStore::new();
        let replica = Replica::new("doc-1");
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.record(edit(&replica, "offline draft"));

        let outcome = queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Initialized);
        assert_eq!(store.text("doc-1").unwrap(), "offline draft");
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_both_sides_changed_is_conflict() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        store.edit("doc-1", |server| server.push(" remote"));
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.record(edit(&replica, " local"));

        let outcome = queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Conflict);
        assert_eq!(queue.mode(), OfflineMode::Conflict);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(store.text("doc-1").unwrap(), "base remote");
    }

    #[tokio::test]
    async fn test_resolve_strategies() {
        for (strategy, expected) in [
            (ConflictStrategy::LocalWins, Some("base local")),
            (ConflictStrategy::RemoteWins, Some("base remote")),
            (ConflictStrategy::Merge, None),
        ] {
            let store = MemoryRemoteStore::new();
            let replica = shared_replica(&store, "base").await;
            store.edit("doc-1", |server| server.push(" remote"));
            let queue = OfflineQueue::new("doc-1", config(10), None);
            queue.record(edit(&replica, " local"));
            queue.reconcile(&replica, &store).await.unwrap();

            queue.resolve(strategy, &replica, &store).await.unwrap();

            assert_eq!(queue.mode(), OfflineMode::Online);
            assert!(!queue.has_unsynced_changes());
            assert_eq!(store.text("doc-1").unwrap(), replica.text());
            match expected {
                Some(text) => assert_eq!(replica.text(), text),
                None => {
                    let merged = replica.text();
                    assert!(merged.contains(" local") && merged.contains(" remote"));
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_during_resolve_are_sent() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        store.edit("doc-1", |server| server.push(" remote"));
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.record(edit(&replica, " local"));
        queue.reconcile(&replica, &store).await.unwrap();
        store.set_write_latency(Duration::from_millis(50));

        let typing = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.record(edit(&replica, " typed"));
        };
        let (resolved, ()) = tokio::join!(
            queue.resolve(ConflictStrategy::Merge, &replica, &store),
            typing
        );
        resolved.unwrap();

        assert!(replica.text().ends_with(" typed"));
        assert_eq!(store.text("doc-1").unwrap(), replica.text());
        assert_eq!(queue.pending_count(), 0);
        assert!(!queue.has_unsynced_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_during_initialize_are_sent() {
        let store = MemoryRemoteStore::new();
        store.set_write_latency(Duration::from_millis(50));
        let replica = Replica::new("doc-1");
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.record(edit(&replica, "draft"));

        let typing = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.record(edit(&replica, " more"));
        };
        let (outcome, ()) = tokio::join!(queue.reconcile(&replica, &store), typing);

        assert_eq!(outcome.unwrap(), ReconcileOutcome::Initialized);
        assert_eq!(store.text("doc-1").unwrap(), "draft more");
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.mode(), OfflineMode::Online);
    }

    #[tokio::test]
    async fn test_auto_resolve_merges() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        store.edit("doc-1", |server| server.push(" remote"));
        let mut auto = config(10);
        auto.auto_resolve_conflicts = true;
        let queue = OfflineQueue::new("doc-1", auto, None);
        queue.record(edit(&replica, " local"));

        let outcome = queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AutoResolved);
        assert_eq!(queue.mode(), OfflineMode::Online);
        assert_eq!(store.text("doc-1").unwrap(), replica.text());
    }

    #[tokio::test]
    async fn test_evicted_operations_are_caught_up() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "").await;
        let queue = OfflineQueue::new("doc-1", config(2), None);
        for word in ["a", "b", "c", "d"] {
            queue.record(edit(&replica, word));
        }
        assert_eq!(queue.pending_count(), 2);

        queue.reconcile(&replica, &store).await.unwrap();
        assert_eq!(store.text("doc-1").unwrap(), "abcd");
        assert!(!queue.has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_reconcile_failure_keeps_queue() {
        let store = MemoryRemoteStore::new();
        let replica = shared_replica(&store, "base").await;
        let queue = OfflineQueue::new("doc-1", config(10), None);
        queue.record(edit(&replica, " x"));
        store.set_reachable(false);

        assert!(queue.reconcile(&replica, &store).await.is_err());
        assert_eq!(queue.mode(), OfflineMode::Offline);
        assert_eq!(queue.pending_count(), 1);
    }
}
