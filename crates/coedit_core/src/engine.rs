//! Per-document sync engine.
//!
//! [`SyncEngine`] ties one [`Replica`] to a [`RemoteStore`]:
//!
//! - **Outbound**: local edits (origin [`UpdateOrigin::Local`] only) are fed
//!   through a channel into the [`UpdateBatcher`] while online, or into the
//!   [`OfflineQueue`] otherwise. Acknowledged batches advance the last-synced
//!   state vector; a delta returned by the server is applied with origin
//!   [`UpdateOrigin::ServerConflict`].
//! - **Inbound**: remote snapshots from the live subscription are applied with
//!   origin [`UpdateOrigin::ServerSubscription`], skipping stale ones (server
//!   timestamp not strictly newer than the last applied one) and ones that
//!   would not change the replica.
//! - **Connectivity**: the engine follows a [`ConnectionManager`]. Losing the
//!   connection switches the offline queue to [`OfflineMode::Offline`];
//!   regaining it re-subscribes and reconciles.
//!
//! None of these paths panics or stops the engine on failure. Errors are
//! recorded in [`SyncStatus::last_error`].

use std::sync::{Arc, Mutex, Weak};

use futures_lite::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use ts_rs::TS;
use yrs::Subscription;

use crate::batcher::{BatchSink, FlushedBatch, UpdateBatcher};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionTest};
use crate::crdt::{CrdtStorage, Replica, UpdateOrigin};
use crate::error::{CoeditError, Result};
use crate::offline::{ConflictStrategy, OfflineMode, OfflineQueue, ReconcileOutcome};
use crate::recovery::CloudRecovery;
use crate::remote::{BoxFuture, RemoteState, RemoteStore};
use crate::scheduler::ScheduledTask;
use crate::stats::{SyncStats, SyncStatsSnapshot};

/// Engine status, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SyncStatus {
    /// Connected, nothing queued and nothing waiting in the batcher
    pub synced: bool,
    /// A send or reconciliation is in progress
    pub syncing: bool,
    /// Connection state
    pub connection: ConnectionState,
    /// Offline queue mode
    pub offline_mode: OfflineMode,
    /// Queued offline operations
    pub pending_operations: usize,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            synced: false,
            syncing: false,
            connection: ConnectionState::Disconnected,
            offline_mode: OfflineMode::Online,
            pending_operations: 0,
            last_error: None,
        }
    }
}

/// Keeps one replica in sync with the remote store.
pub struct SyncEngine {
    doc_id: String,
    replica: Arc<Replica>,
    remote: Arc<dyn RemoteStore>,
    connection: ConnectionManager,
    offline: OfflineQueue,
    batcher: UpdateBatcher,
    stats: Arc<SyncStats>,
    status: watch::Sender<SyncStatus>,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    started: bool,
    /// Server timestamp of the newest remote state applied
    last_applied_at: Option<i64>,
    /// Local state vector at the last acknowledged send
    last_synced_sv: Option<Vec<u8>>,
    /// Sends currently awaiting the remote
    sends_in_flight: usize,
    local_changes: Option<Subscription>,
    outbound_pump: Option<ScheduledTask>,
    inbound: Option<ScheduledTask>,
    connection_watcher: Option<ScheduledTask>,
}

/// Batcher sink delivering to the remote store. Holds the engine weakly.
struct EngineSink {
    engine: Weak<SyncEngine>,
}

impl BatchSink for EngineSink {
    fn send_batch(&self, batch: FlushedBatch) -> BoxFuture<'static, Result<()>> {
        let engine = self.engine.clone();
        Box::pin(async move {
            match engine.upgrade() {
                Some(engine) => engine.send(batch).await,
                None => Ok(()),
            }
        })
    }
}

impl SyncEngine {
    /// Create an engine for `replica`.
    ///
    /// `storage` backs the offline queue; without it the queue is memory-only.
    /// Nothing happens until [`start`](Self::start).
    pub fn new(
        replica: Arc<Replica>,
        remote: Arc<dyn RemoteStore>,
        connection: ConnectionManager,
        config: &SyncConfig,
        storage: Option<Arc<dyn CrdtStorage>>,
    ) -> Arc<Self> {
        let doc_id = replica.doc_id().to_string();
        let stats = Arc::new(SyncStats::new());
        let (status, _) = watch::channel(SyncStatus {
            connection: connection.state(),
            ..SyncStatus::default()
        });

        Arc::new_cyclic(|engine| Self {
            offline: OfflineQueue::new(doc_id.clone(), config.offline.clone(), storage),
            batcher: UpdateBatcher::new(
                config.batch.clone(),
                Arc::new(EngineSink {
                    engine: engine.clone(),
                }),
                Arc::clone(&stats),
            ),
            doc_id,
            replica,
            remote,
            connection,
            stats,
            status,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Document id.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The synced replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The offline queue.
    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.offline
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Counters for this engine.
    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Reset this engine's counters.
    pub fn clear_stats(&self) {
        self.stats.clear();
    }

    /// Local state vector at the last acknowledged send.
    pub fn last_synced_state_vector(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().last_synced_sv.clone()
    }

    /// Start syncing.
    ///
    /// Restores the persisted offline queue, hooks local changes, makes sure
    /// the remote state exists, subscribes to it and starts following the
    /// connection. Remote failures are recorded, not returned; the engine
    /// catches up once the connection is established.
    ///
    /// # Errors
    ///
    /// Only if the local change observer cannot be registered.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Ok(());
            }
            state.started = true;
        }
        log::info!("[SyncEngine] Starting sync for '{}'", self.doc_id);

        if let Err(e) = self.offline.restore() {
            log::warn!(
                "[SyncEngine] Could not restore offline queue for '{}': {}",
                self.doc_id,
                e
            );
        }

        self.hook_local_changes()?;

        if let Err(e) = self.initialize().await {
            self.record_error(&e);
        }
        if let Err(e) = self.subscribe_inbound().await {
            self.record_error(&e);
        }

        if !self.connection.has_connection_test() {
            self.connection.set_connection_test(self.remote_probe());
        }
        self.watch_connection();
        self.refresh_status();
        Ok(())
    }

    /// Stop syncing.
    ///
    /// The open batch is handed to the remote; the subscription, observers and
    /// timers are torn down. A stopped engine cannot be restarted.
    pub fn stop(&self) {
        self.batcher.shutdown(true);
        let mut state = self.state.lock().unwrap();
        state.local_changes = None;
        state.outbound_pump = None;
        state.inbound = None;
        state.connection_watcher = None;
        log::info!("[SyncEngine] Stopped sync for '{}'", self.doc_id);
    }

    /// Send the open batch now.
    pub fn flush(&self) {
        self.batcher.flush_now();
    }

    /// Fetch the full remote state and apply it.
    ///
    /// # Errors
    ///
    /// [`CoeditError::NotInitialized`] if the remote has no state for this
    /// document, or the remote store's error.
    pub async fn resync(&self) -> Result<()> {
        let remote_state = self
            .remote
            .get_state(&self.doc_id)
            .await?
            .ok_or_else(|| CoeditError::NotInitialized(self.doc_id.clone()))?;
        self.replica
            .apply_update(&remote_state.snapshot, UpdateOrigin::ServerResync)?;
        self.mark_applied(remote_state.updated_at);
        self.replace_placeholder(&remote_state).await?;
        log::info!("[SyncEngine] Resynced '{}'", self.doc_id);
        self.refresh_status();
        Ok(())
    }

    /// Settle a conflict reported by the offline queue.
    pub async fn resolve_conflict(&self, strategy: ConflictStrategy) -> Result<()> {
        let result = self
            .offline
            .resolve(strategy, &self.replica, self.remote.as_ref())
            .await;
        match &result {
            Ok(()) => self.status.send_modify(|s| s.last_error = None),
            Err(e) => self.record_error(e),
        }
        self.refresh_status();
        result
    }

    /// Apply a remote snapshot received from the live subscription.
    pub fn handle_remote_state(&self, remote_state: RemoteState) {
        if self.offline.mode() != OfflineMode::Online {
            log::debug!(
                "[SyncEngine] Ignoring remote state for '{}' while {:?}",
                self.doc_id,
                self.offline.mode()
            );
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.last_applied_at
                && remote_state.updated_at <= last
            {
                log::debug!(
                    "[SyncEngine] Skipping stale remote state for '{}' ({} <= {})",
                    self.doc_id,
                    remote_state.updated_at,
                    last
                );
                return;
            }
            state.last_applied_at = Some(remote_state.updated_at);
        }

        match self.replica.would_change(&remote_state.snapshot) {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = self
                    .replica
                    .apply_update(&remote_state.snapshot, UpdateOrigin::ServerSubscription)
                {
                    self.record_error(&e);
                    return;
                }
                log::debug!("[SyncEngine] Applied remote state for '{}'", self.doc_id);
            }
            Err(e) => self.record_error(&e),
        }
    }

    /// Create the remote state if it doesn't exist, otherwise merge it in.
    async fn initialize(&self) -> Result<()> {
        let existing = match self.remote.get_state(&self.doc_id).await? {
            Some(existing) => Some(existing),
            None => {
                // Nothing to restore, so the notice must not become the initial state
                CloudRecovery::clear_placeholder(&self.replica);
                let created = self
                    .remote
                    .initialize_state(
                        &self.doc_id,
                        &self.replica.encode_state_as_update(),
                        &self.replica.encode_state_vector(),
                    )
                    .await?;
                if created {
                    log::info!("[SyncEngine] Initialized remote state for '{}'", self.doc_id);
                    self.state.lock().unwrap().last_synced_sv =
                        Some(self.replica.encode_state_vector());
                    None
                } else {
                    // Lost the race; merge the winner
                    self.remote.get_state(&self.doc_id).await?
                }
            }
        };

        if let Some(existing) = existing {
            self.replica
                .apply_update(&existing.snapshot, UpdateOrigin::ServerResync)?;
            self.mark_applied(existing.updated_at);
            self.replace_placeholder(&existing).await?;
        }
        Ok(())
    }

    /// Remove a recovery placeholder now that `remote_state` is merged in, and
    /// send the removal so both sides hold the same state.
    async fn replace_placeholder(&self, remote_state: &RemoteState) -> Result<()> {
        if !CloudRecovery::clear_placeholder(&self.replica) {
            return Ok(());
        }
        let diff = self.replica.encode_diff(&remote_state.state_vector)?;
        let result = self
            .remote
            .apply_update(&self.doc_id, &diff, self.replica.client_id())
            .await?;
        if !result.accepted {
            return Err(CoeditError::Rejected(self.doc_id.clone()));
        }
        self.state.lock().unwrap().last_synced_sv = Some(self.replica.encode_state_vector());
        log::info!(
            "[SyncEngine] Replaced recovery placeholder of '{}' with remote content",
            self.doc_id
        );
        Ok(())
    }

    fn hook_local_changes(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = self.replica.observe_local_changes(move |update| {
            let _ = tx.send(update.to_vec());
        })?;

        let weak = Arc::downgrade(self);
        let pump = ScheduledTask::spawn(async move {
            while let Some(update) = rx.recv().await {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                engine.route_local(update);
            }
        });

        let mut state = self.state.lock().unwrap();
        state.local_changes = Some(subscription);
        state.outbound_pump = Some(pump);
        Ok(())
    }

    fn route_local(&self, update: Vec<u8>) {
        let queued = self.offline.mode() != OfflineMode::Online && self.offline.record(update.clone());
        if !queued {
            self.batcher.push(update);
        }
        self.refresh_status();
    }

    async fn subscribe_inbound(self: &Arc<Self>) -> Result<()> {
        let mut stream = self.remote.subscribe_state(&self.doc_id).await?;
        let weak = Arc::downgrade(self);
        let task = ScheduledTask::spawn(async move {
            while let Some(remote_state) = stream.next().await {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                engine.handle_remote_state(remote_state);
            }
        });
        self.state.lock().unwrap().inbound = Some(task);
        log::debug!("[SyncEngine] Subscribed to remote state for '{}'", self.doc_id);
        Ok(())
    }

    fn remote_probe(&self) -> ConnectionTest {
        let remote = Arc::clone(&self.remote);
        let doc_id = self.doc_id.clone();
        Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let remote = Arc::clone(&remote);
            let doc_id = doc_id.clone();
            Box::pin(async move { remote.get_state(&doc_id).await.map(|_| ()) })
        })
    }

    fn watch_connection(self: &Arc<Self>) {
        let mut connection = self.connection.subscribe();
        let weak = Arc::downgrade(self);
        let watcher = ScheduledTask::spawn(async move {
            let mut current = connection.borrow_and_update().state;
            loop {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                engine.on_connection_state(current).await;
                drop(engine);

                if connection.changed().await.is_err() {
                    return;
                }
                current = connection.borrow_and_update().state;
            }
        });
        self.state.lock().unwrap().connection_watcher = Some(watcher);
    }

    async fn on_connection_state(self: &Arc<Self>, connection: ConnectionState) {
        self.refresh_status();
        if connection == ConnectionState::Connecting {
            return;
        }
        if connection != ConnectionState::Connected {
            if self.offline.is_enabled() && self.offline.mode() == OfflineMode::Online {
                self.offline.set_mode(OfflineMode::Offline);
                self.refresh_status();
            }
            return;
        }

        let subscribed = {
            let state = self.state.lock().unwrap();
            state.inbound.as_ref().is_some_and(|task| !task.is_finished())
        };
        if !subscribed && let Err(e) = self.subscribe_inbound().await {
            self.record_error(&e);
        }

        if CloudRecovery::holds_placeholder(&self.replica)
            && let Err(e) = self.initialize().await
        {
            self.record_error(&e);
        }

        let mode = self.offline.mode();
        if mode == OfflineMode::Conflict
            || (mode == OfflineMode::Online && !self.offline.has_unsynced_changes())
        {
            return;
        }

        self.status.send_modify(|s| s.syncing = true);
        match self
            .offline
            .reconcile(&self.replica, self.remote.as_ref())
            .await
        {
            Ok(ReconcileOutcome::Conflict) => {
                self.record_error(&CoeditError::Conflict(self.doc_id.clone()));
            }
            Ok(outcome) => {
                log::info!("[SyncEngine] Reconciled '{}': {:?}", self.doc_id, outcome);
                self.status.send_modify(|s| s.last_error = None);
            }
            Err(e) => self.record_error(&e),
        }
        self.status.send_modify(|s| s.syncing = false);
        self.refresh_status();
    }

    async fn send(&self, batch: FlushedBatch) -> Result<()> {
        if !self.connection.is_connected() {
            if self.offline.is_enabled() {
                log::debug!(
                    "[SyncEngine] Not connected, queueing {} updates for '{}'",
                    batch.updates.len(),
                    self.doc_id
                );
                self.offline.set_mode(OfflineMode::Offline);
                for update in batch.updates {
                    self.offline.record(update);
                }
                self.refresh_status();
                return Ok(());
            }
            return Err(CoeditError::Offline);
        }

        let updates = match batch.merged {
            Some(merged) => vec![merged],
            None => batch.updates,
        };
        let state_vector = self.replica.encode_state_vector();

        self.begin_send();
        let result = self
            .remote
            .apply_batched_updates(&self.doc_id, &updates, &state_vector, self.replica.client_id())
            .await;
        self.end_send();

        let result = match result {
            Ok(result) if result.accepted => result,
            Ok(_) => {
                let e = CoeditError::Rejected(self.doc_id.clone());
                self.record_error(&e);
                return Err(e);
            }
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        self.state.lock().unwrap().last_synced_sv = Some(state_vector);
        if let Some(missing) = result.conflict_update
            && let Err(e) = self
                .replica
                .apply_update(&missing, UpdateOrigin::ServerConflict)
        {
            self.record_error(&e);
        }
        log::debug!(
            "[SyncEngine] Sent {} updates for '{}' (attempt {})",
            result.applied_count,
            self.doc_id,
            batch.attempt
        );
        self.status.send_modify(|s| s.last_error = None);
        self.refresh_status();
        Ok(())
    }

    fn begin_send(&self) {
        self.state.lock().unwrap().sends_in_flight += 1;
        self.status.send_if_modified(|s| !std::mem::replace(&mut s.syncing, true));
    }

    fn end_send(&self) {
        let idle = {
            let mut state = self.state.lock().unwrap();
            state.sends_in_flight = state.sends_in_flight.saturating_sub(1);
            state.sends_in_flight == 0
        };
        if idle {
            self.status.send_if_modified(|s| std::mem::replace(&mut s.syncing, false));
        }
    }

    fn mark_applied(&self, updated_at: i64) {
        let mut state = self.state.lock().unwrap();
        state.last_applied_at = Some(state.last_applied_at.map_or(updated_at, |t| t.max(updated_at)));
    }

    fn record_error(&self, error: &CoeditError) {
        log::warn!("[SyncEngine] '{}': {}", self.doc_id, error);
        let message = error.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
    }

    fn refresh_status(&self) {
        let connection = self.connection.state();
        let offline_mode = self.offline.mode();
        let pending_operations = self.offline.pending_count();
        let synced = connection == ConnectionState::Connected
            && offline_mode == OfflineMode::Online
            && pending_operations == 0
            && self.batcher.is_idle();

        self.status.send_if_modified(|s| {
            let changed = s.connection != connection
                || s.offline_mode != offline_mode
                || s.pending_operations != pending_operations
                || s.synced != synced;
            s.connection = connection;
            s.offline_mode = offline_mode;
            s.pending_operations = pending_operations;
            s.synced = synced;
            changed
        });
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("doc_id", &self.doc_id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::recovery::RECOVERY_NOTICE;
    use crate::remote::MemoryRemoteStore;
    use std::time::Duration;

    struct Fixture {
        store: MemoryRemoteStore,
        network: NetworkMonitor,
        engine: Arc<SyncEngine>,
    }

    fn fixture(store: MemoryRemoteStore) -> Fixture {
        let config = SyncConfig::default();
        let network = NetworkMonitor::new(true);
        let connection = ConnectionManager::new(config.connection.clone(), network.clone());
        let engine = SyncEngine::new(
            Arc::new(Replica::new("doc-1")),
            Arc::new(store.clone()),
            connection,
            &config,
            None,
        );
        Fixture {
            store,
            network,
            engine,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(2500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_initializes_remote() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.replica().set_text("draft");
        f.engine.start().await.unwrap();

        assert_eq!(f.store.text("doc-1").unwrap(), "draft");
        settle().await;
        let status = f.engine.status();
        assert_eq!(status.connection, ConnectionState::Connected);
        assert!(status.synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_merges_existing_remote() {
        let store = MemoryRemoteStore::new();
        store.edit("doc-1", |replica| replica.set_text("remote text"));
        let f = fixture(store);
        f.engine.start().await.unwrap();
        assert_eq!(f.engine.replica().text(), "remote text");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_edits_are_batched_to_remote() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.start().await.unwrap();
        settle().await;

        f.engine.replica().push("a");
        f.engine.replica().push("b");
        f.engine.replica().push("c");
        settle().await;

        assert_eq!(f.store.text("doc-1").unwrap(), "abc");
        let batched: Vec<_> = f
            .store
            .submissions()
            .into_iter()
            .filter(|s| s.client_id == f.engine.replica().client_id())
            .collect();
        assert_eq!(batched.len(), 1);
        assert_eq!(f.engine.stats().batched_updates, 3);
        assert!(f.engine.last_synced_state_vector().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_edits_are_applied() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.start().await.unwrap();
        settle().await;

        f.store.edit("doc-1", |replica| replica.push("from elsewhere"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.engine.replica().text(), "from elsewhere");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_remote_state_is_skipped() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.mark_applied(100);

        let other = Replica::new("doc-1");
        other.set_text("old news");
        f.engine.handle_remote_state(RemoteState {
            snapshot: other.encode_state_as_update(),
            state_vector: other.encode_state_vector(),
            updated_at: 100,
        });
        assert_eq!(f.engine.replica().text(), "");

        f.engine.handle_remote_state(RemoteState {
            snapshot: other.encode_state_as_update(),
            state_vector: other.encode_state_vector(),
            updated_at: 101,
        });
        assert_eq!(f.engine.replica().text(), "old news");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_requires_remote_state() {
        let f = fixture(MemoryRemoteStore::new());
        let err = f.engine.resync().await.unwrap_err();
        assert!(matches!(err, CoeditError::NotInitialized(_)));

        f.store.edit("doc-1", |replica| replica.set_text("server"));
        f.engine.resync().await.unwrap();
        assert_eq!(f.engine.replica().text(), "server");
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_edits_replay_on_reconnect() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.start().await.unwrap();
        settle().await;

        f.network.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.engine.status().offline_mode, OfflineMode::Offline);

        f.engine.replica().push("one ");
        f.engine.replica().push("two");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.engine.status().pending_operations, 2);
        assert_eq!(f.store.text("doc-1").unwrap(), "");

        f.network.set_online(true);
        settle().await;

        assert_eq!(f.store.text("doc-1").unwrap(), "one two");
        let status = f.engine.status();
        assert_eq!(status.offline_mode, OfflineMode::Online);
        assert_eq!(status.pending_operations, 0);
        assert!(status.synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_waits_for_resolution() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.replica().set_text("base");
        f.engine.start().await.unwrap();
        settle().await;

        f.network.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.engine.replica().push(" mine");
        f.store.edit("doc-1", |replica| replica.push(" theirs"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.network.set_online(true);
        settle().await;
        let status = f.engine.status();
        assert_eq!(status.offline_mode, OfflineMode::Conflict);
        assert!(status.last_error.is_some());
        assert_eq!(f.engine.replica().text(), "base mine");

        f.engine
            .resolve_conflict(ConflictStrategy::LocalWins)
            .await
            .unwrap();
        assert_eq!(f.engine.replica().text(), "base mine");
        assert_eq!(f.store.text("doc-1").unwrap(), "base mine");
        assert_eq!(f.engine.status().offline_mode, OfflineMode::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_replaced_after_reconnect() {
        let store = MemoryRemoteStore::new();
        store.edit("doc-1", |replica| replica.set_text("server text"));
        store.set_reachable(false);
        let f = fixture(store);
        CloudRecovery::merge_into(f.engine.replica(), CloudRecovery::placeholder("doc-1")).unwrap();

        f.engine.start().await.unwrap();
        assert_eq!(f.engine.replica().text(), RECOVERY_NOTICE);

        f.store.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(f.engine.status().connection, ConnectionState::Connected);
        assert_eq!(f.engine.replica().text(), "server text");
        assert_eq!(f.store.text("doc-1").unwrap(), "server text");
        assert_eq!(f.engine.status().offline_mode, OfflineMode::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stats() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.start().await.unwrap();
        settle().await;
        f.engine.replica().push("counted");
        settle().await;
        assert_eq!(f.engine.stats().batched_updates, 1);

        f.engine.clear_stats();
        assert_eq!(f.engine.stats().batched_updates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sends_open_batch() {
        let f = fixture(MemoryRemoteStore::new());
        f.engine.start().await.unwrap();
        settle().await;

        f.engine.replica().push("last words");
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.engine.stop();
        settle().await;
        assert_eq!(f.store.text("doc-1").unwrap(), "last words");

        f.store.edit("doc-1", |replica| replica.push("!"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.engine.replica().text(), "last words");
    }
}
