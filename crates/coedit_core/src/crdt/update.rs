//! Update-level CRDT primitives.
//!
//! These operate on encoded yrs v1 updates without a live document, which is
//! what the batcher and the offline reconciliation need: merging queued deltas,
//! diffing against a state vector, and deciding which side of a sync has
//! changes the other has not seen.

use super::replica::Replica;
use super::types::UpdateOrigin;
use crate::error::{CoeditError, Result};

/// Merge several updates into one. The result is independent of input order.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>> {
    let refs: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
    yrs::merge_updates_v1(&refs)
        .map_err(|e| CoeditError::Crdt(format!("Failed to merge updates: {}", e)))
}

/// Strip from `update` everything already covered by `state_vector`.
pub fn diff_update(update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>> {
    yrs::diff_updates_v1(update, state_vector)
        .map_err(|e| CoeditError::Crdt(format!("Failed to diff update: {}", e)))
}

/// Compute the state vector described by an encoded update.
pub fn state_vector_of(update: &[u8]) -> Result<Vec<u8>> {
    yrs::encode_state_vector_from_update_v1(update)
        .map_err(|e| CoeditError::Crdt(format!("Failed to read state vector: {}", e)))
}

/// Which sides of a local/remote pair hold changes unknown to the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Divergence {
    /// The local replica has changes the remote has not seen.
    pub local_ahead: bool,
    /// The remote has changes the local replica has not seen.
    pub remote_ahead: bool,
}

impl Divergence {
    /// Both sides moved independently.
    pub fn is_conflict(&self) -> bool {
        self.local_ahead && self.remote_ahead
    }

    /// Neither side has anything new for the other.
    pub fn is_in_sync(&self) -> bool {
        !self.local_ahead && !self.remote_ahead
    }
}

/// Compare two encoded document states.
///
/// A side is "ahead" when applying its state to a copy of the other side would
/// change that copy (see [`Replica::would_change`]). Byte-level non-emptiness
/// of a diff is not used: yrs diffs always carry the full delete set, so a
/// tombstone both sides already share would otherwise read as divergence.
pub fn compare_states(local_state: &[u8], remote_state: &[u8]) -> Result<Divergence> {
    let local = Replica::from_state("compare-local", local_state, UpdateOrigin::Remote)?;
    let remote = Replica::from_state("compare-remote", remote_state, UpdateOrigin::Remote)?;

    Ok(Divergence {
        local_ahead: remote.would_change(local_state)?,
        remote_ahead: local.would_change(remote_state)?,
    })
}
