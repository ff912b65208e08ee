//! Remote document store contract.
//!
//! The sync pipeline never talks to a transport directly. It is written against
//! [`RemoteStore`], an object-safe async trait returning boxed futures, so the
//! same engine runs over a hosted database, a WebSocket relay, or the
//! in-process [`MemoryRemoteStore`] used by tests and demos.
//!
//! # Data model
//!
//! The remote keeps, per document id, one merged CRDT snapshot, its state
//! vector, and a server-assigned `updated_at` that strictly increases with
//! every accepted write. Live subscribers receive the full [`RemoteState`]
//! after each write; the client applies it idempotently.

mod memory;

pub use memory::{MemoryRemoteStore, Submission};

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::recovery::LegacyText;

/// A boxed future for object-safe async methods.
///
/// Futures are `Send` so they can be driven by spawned tokio tasks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed stream of remote state snapshots.
pub type StateStream = futures_lite::stream::Boxed<RemoteState>;

/// Authoritative state of a document on the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    /// Full encoded CRDT state
    pub snapshot: Vec<u8>,
    /// Encoded state vector of `snapshot`
    pub state_vector: Vec<u8>,
    /// Server timestamp (milliseconds), strictly increasing per document
    pub updated_at: i64,
}

/// Outcome of a single update submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyUpdateResult {
    /// The server merged the update
    pub accepted: bool,
    /// Delta the client is missing, when the server already had concurrent changes
    pub conflict_update: Option<Vec<u8>>,
}

/// Outcome of a batched submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchApplyResult {
    /// The server merged the batch
    pub accepted: bool,
    /// How many of the submitted updates were merged
    pub applied_count: usize,
    /// Delta the client is missing, when the server already had concurrent changes
    pub conflict_update: Option<Vec<u8>>,
}

/// Content the remote can offer for rebuilding a corrupted local replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySnapshot {
    /// Last known binary CRDT snapshot
    pub binary_snapshot: Option<Vec<u8>>,
    /// Text stored by earlier, non-CRDT versions of the document
    pub legacy_text: Option<LegacyText>,
}

/// Remote document store used by the sync engine, the offline queue and cloud
/// recovery.
///
/// # Errors
///
/// Transport failures should be reported as
/// [`CoeditError::Network`](crate::error::CoeditError::Network) so they are
/// retried; access failures as
/// [`CoeditError::Unauthorized`](crate::error::CoeditError::Unauthorized).
pub trait RemoteStore: Send + Sync {
    /// Fetch the current state, or `None` if the document was never initialized.
    fn get_state<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Result<Option<RemoteState>>>;

    /// Subscribe to live state. The stream yields the state after every write.
    fn subscribe_state<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Result<StateStream>>;

    /// Submit one update.
    fn apply_update<'a>(
        &'a self,
        doc_id: &'a str,
        update: &'a [u8],
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<ApplyUpdateResult>>;

    /// Submit several updates at once, along with the sender's state vector.
    fn apply_batched_updates<'a>(
        &'a self,
        doc_id: &'a str,
        updates: &'a [Vec<u8>],
        state_vector: &'a [u8],
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<BatchApplyResult>>;

    /// Create the remote state if none exists.
    ///
    /// Returns `true` if this call created it. When a concurrent initializer
    /// won, nothing is written and the caller merges the winner's state.
    fn initialize_state<'a>(
        &'a self,
        doc_id: &'a str,
        snapshot: &'a [u8],
        state_vector: &'a [u8],
    ) -> BoxFuture<'a, Result<bool>>;

    /// Fetch content for cloud recovery, if the store has any.
    fn get_recovery_snapshot<'a>(
        &'a self,
        doc_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RecoverySnapshot>>>;
}
