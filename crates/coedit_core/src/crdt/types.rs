//! Core types for CRDT-based synchronization.
//!
//! This module defines the origin tags attached to every replica transaction
//! and the persisted form of CRDT updates.

use serde::{Deserialize, Serialize};

/// A single CRDT update with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtUpdate {
    /// Storage-assigned update ID
    pub update_id: i64,

    /// Document the update belongs to
    pub doc_name: String,

    /// Raw yrs v1 update payload
    pub data: Vec<u8>,

    /// Unix timestamp (milliseconds) when the update was recorded
    pub timestamp: i64,

    /// Origin of the update
    pub origin: UpdateOrigin,
}

/// Origin of a CRDT update, used to distinguish local vs remote changes.
///
/// Every mutation of a [`Replica`](super::Replica) happens inside a transaction
/// tagged with one of these. Only [`UpdateOrigin::Local`] updates are sent to
/// the remote store; everything else was either received from it or must not
/// leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a peer outside the server path
    Remote,

    /// Update applied from a server acknowledgement or initial load
    Server,

    /// Update applied from the live remote subscription
    ServerSubscription,

    /// Update applied by an explicit full resync
    ServerResync,

    /// Conflict-resolution delta returned by (or pushed to) the server
    ServerConflict,

    /// Content merged in by cloud recovery
    Recovery,

    /// State replayed from local persistence
    Persistence,
}

impl UpdateOrigin {
    /// Stable tag used as the yrs transaction origin.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOrigin::Local => "local",
            UpdateOrigin::Remote => "remote",
            UpdateOrigin::Server => "server",
            UpdateOrigin::ServerSubscription => "server-subscription",
            UpdateOrigin::ServerResync => "server-resync",
            UpdateOrigin::ServerConflict => "server-conflict",
            UpdateOrigin::Recovery => "recovery",
            UpdateOrigin::Persistence => "persistence",
        }
    }

    /// Whether updates with this origin belong on the outbound path.
    pub fn is_outbound(&self) -> bool {
        matches!(self, UpdateOrigin::Local)
    }

    /// Map a raw transaction origin back to the typed tag.
    ///
    /// Transactions without an origin, or with a tag this crate did not set
    /// (an editor binding's own marker, for instance), are local edits.
    pub fn from_origin_bytes(origin: Option<&[u8]>) -> Self {
        origin
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|tag| tag.parse().ok())
            .unwrap_or(UpdateOrigin::Local)
    }
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "server" => Ok(UpdateOrigin::Server),
            "server-subscription" => Ok(UpdateOrigin::ServerSubscription),
            "server-resync" => Ok(UpdateOrigin::ServerResync),
            "server-conflict" => Ok(UpdateOrigin::ServerConflict),
            "recovery" => Ok(UpdateOrigin::Recovery),
            "persistence" => Ok(UpdateOrigin::Persistence),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_round_trips_through_tag() {
        for origin in [
            UpdateOrigin::Local,
            UpdateOrigin::Remote,
            UpdateOrigin::Server,
            UpdateOrigin::ServerSubscription,
            UpdateOrigin::ServerResync,
            UpdateOrigin::ServerConflict,
            UpdateOrigin::Recovery,
            UpdateOrigin::Persistence,
        ] {
            assert_eq!(origin.as_str().parse::<UpdateOrigin>(), Ok(origin));
        }
    }

    #[test]
    fn test_only_local_is_outbound() {
        assert!(UpdateOrigin::Local.is_outbound());
        assert!(!UpdateOrigin::ServerSubscription.is_outbound());
        assert!(!UpdateOrigin::ServerConflict.is_outbound());
        assert!(!UpdateOrigin::Recovery.is_outbound());
    }

    #[test]
    fn test_untagged_and_foreign_origins_are_local() {
        assert_eq!(UpdateOrigin::from_origin_bytes(None), UpdateOrigin::Local);
        assert_eq!(
            UpdateOrigin::from_origin_bytes(Some(b"prosemirror-binding")),
            UpdateOrigin::Local
        );
        assert_eq!(
            UpdateOrigin::from_origin_bytes(Some(b"server-resync")),
            UpdateOrigin::ServerResync
        );
    }
}
