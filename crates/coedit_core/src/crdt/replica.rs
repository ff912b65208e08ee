//! Replicated document state.
//!
//! This module provides `Replica`, a Y.Doc wrapper holding one document's
//! linear rich-text content. It exposes the encode / apply / diff primitives
//! the sync pipeline is written against, and a local change-notification
//! stream filtered by transaction origin.

use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Subscription, Text, TextRef,
    Transact, Update, updates::decoder::Decode, updates::encoder::Encode,
};

use super::types::UpdateOrigin;
use crate::error::{CoeditError, Result};

/// Name of the Y.Text holding the document content.
pub const CONTENT_TEXT_NAME: &str = "content";

/// A CRDT replica of a single document.
///
/// Every mutation runs inside a yrs transaction tagged with an
/// [`UpdateOrigin`]. Observers registered with
/// [`observe_local_changes`](Replica::observe_local_changes) only see
/// transactions whose origin is outbound, which is what keeps received
/// updates from being sent back to the server.
///
/// # Example
///
/// ```ignore
/// use coedit_core::crdt::{Replica, UpdateOrigin};
///
/// let a = Replica::new("doc-1");
/// let b = Replica::new("doc-1");
///
/// a.set_text("Hello");
/// b.apply_update(&a.encode_state_as_update(), UpdateOrigin::Remote).unwrap();
/// assert_eq!(b.text(), "Hello");
/// ```
pub struct Replica {
    doc: Doc,
    content: TextRef,
    doc_id: String,
    client_id: String,
}

impl Replica {
    /// Create a new empty replica for a document.
    ///
    /// Each replica gets a fresh client identifier, unique per process instance.
    pub fn new(doc_id: impl Into<String>) -> Self {
        let doc = new_doc();
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);

        Self {
            doc,
            content,
            doc_id: doc_id.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Build a replica from an encoded state (a full snapshot or any update).
    pub fn from_state(
        doc_id: impl Into<String>,
        state: &[u8],
        origin: UpdateOrigin,
    ) -> Result<Self> {
        let replica = Self::new(doc_id);
        replica.apply_update(state, origin)?;
        Ok(replica)
    }

    /// Get the document identifier.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Get the client identifier reported to the remote store.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ==================== Content Operations ====================

    /// Get the full text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Get the length of the content in yrs offset units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    /// Whether the content is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the content as a local edit, using minimal diff operations.
    pub fn set_text(&self, content: &str) {
        self.set_text_with_origin(content, UpdateOrigin::Local);
    }

    /// Replace the content, tagging the transaction with `origin`.
    ///
    /// Only the differing middle section is deleted and re-inserted, so item
    /// IDs of the common prefix and suffix survive and concurrent edits there
    /// still merge.
    pub fn set_text_with_origin(&self, content: &str, origin: UpdateOrigin) {
        let current = self.text();
        if current == content {
            return;
        }

        let prefix = common_prefix_len(&current, content);
        let suffix = common_suffix_len(&current[prefix..], &content[prefix..]);

        let delete_len = current.len() - prefix - suffix;
        let insert = &content[prefix..content.len() - suffix];

        let mut txn = self.doc.transact_mut_with(origin.as_str());
        if delete_len > 0 {
            self.content
                .remove_range(&mut txn, prefix as u32, delete_len as u32);
        }
        if !insert.is_empty() {
            self.content.insert(&mut txn, prefix as u32, insert);
        }
    }

    /// Insert text at a specific offset as a local edit.
    pub fn insert(&self, index: u32, text: &str) {
        let mut txn = self.doc.transact_mut_with(UpdateOrigin::Local.as_str());
        self.content.insert(&mut txn, index, text);
    }

    /// Append text at the end as a local edit.
    pub fn push(&self, text: &str) {
        let mut txn = self.doc.transact_mut_with(UpdateOrigin::Local.as_str());
        self.content.push(&mut txn, text);
    }

    /// Delete a range of content as a local edit.
    pub fn delete_range(&self, index: u32, length: u32) {
        let mut txn = self.doc.transact_mut_with(UpdateOrigin::Local.as_str());
        self.content.remove_range(&mut txn, index, length);
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff between current state and a remote state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| CoeditError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update inside a transaction tagged with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = decode_update(update)?;
        let mut txn = self.doc.transact_mut_with(origin.as_str());
        txn.apply_update(decoded)
            .map_err(|e| CoeditError::Crdt(format!("Failed to apply update: {}", e)))
    }

    /// Check whether applying `update` would change this replica.
    ///
    /// The update is applied to a disposable copy of the current state; the
    /// replica itself is never touched. A change is any advance of the state
    /// vector or any difference in the visible text, so deletions of content
    /// the replica already deleted do not count.
    pub fn would_change(&self, update: &[u8]) -> Result<bool> {
        let incoming = decode_update(update)?;

        let (state, sv_before, text_before) = {
            let txn = self.doc.transact();
            (
                txn.encode_state_as_update_v1(&StateVector::default()),
                txn.state_vector(),
                self.content.get_string(&txn),
            )
        };

        let scratch = new_doc();
        let scratch_text = scratch.get_or_insert_text(CONTENT_TEXT_NAME);
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(decode_update(&state)?)
                .map_err(|e| CoeditError::Crdt(format!("Failed to copy replica state: {}", e)))?;
            txn.apply_update(incoming)
                .map_err(|e| CoeditError::Crdt(format!("Failed to apply update: {}", e)))?;
        }

        let txn = scratch.transact();
        Ok(txn.state_vector() != sv_before || scratch_text.get_string(&txn) != text_before)
    }

    // ==================== Observers ====================

    /// Observe every committed update together with its origin.
    ///
    /// The callback runs while the transaction commits; it must not open
    /// another transaction on this replica.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[u8], UpdateOrigin) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = UpdateOrigin::from_origin_bytes(txn.origin().map(|o| o.as_ref()));
                callback(&event.update, origin);
            })
            .map_err(|e| CoeditError::Crdt(format!("Failed to observe document updates: {:?}", e)))
    }

    /// Observe local (outbound) changes only.
    pub fn observe_local_changes<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.observe_updates(move |update, origin| {
            if origin.is_outbound() {
                callback(update);
            }
        })
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("doc_id", &self.doc_id)
            .field("client_id", &self.client_id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Text offsets are counted in UTF-8 bytes, matching `str` indexing.
fn new_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Bytes,
        ..Options::default()
    })
}

fn decode_update(update: &[u8]) -> Result<Update> {
    Update::decode_v1(update)
        .map_err(|e| CoeditError::Crdt(format!("Failed to decode update: {}", e)))
}

/// Byte length of the common prefix, on a char boundary.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

/// Byte length of the common suffix, on a char boundary.
fn common_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_new_replica_is_empty() {
        let replica = Replica::new("doc-1");
        assert_eq!(replica.text(), "");
        assert!(replica.is_empty());
        assert_eq!(replica.doc_id(), "doc-1");
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = Replica::new("doc-1");
        let b = Replica::new("doc-1");
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_set_text_uses_minimal_diff() {
        let replica = Replica::new("doc-1");
        replica.set_text("Hello World");
        replica.set_text("Hello Brave World");
        assert_eq!(replica.text(), "Hello Brave World");

        replica.set_text("Hello World");
        assert_eq!(replica.text(), "Hello World");
    }

    #[test]
    fn test_set_text_handles_multibyte_content() {
        let replica = Replica::new("doc-1");
        replica.set_text("café au lait");
        replica.set_text("café noir");
        assert_eq!(replica.text(), "café noir");
    }

    #[test]
    fn test_insert_and_delete() {
        let replica = Replica::new("doc-1");
        replica.set_text("Hello World");
        replica.insert(6, "Beautiful ");
        assert_eq!(replica.text(), "Hello Beautiful World");

        replica.delete_range(6, 10);
        assert_eq!(replica.text(), "Hello World");
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = Replica::new("doc-1");
        let b = Replica::new("doc-1");

        a.set_text("Hello World");
        b.apply_update(&a.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        a.insert(0, "A: ");
        b.push("!");

        let update_a = a.encode_state_as_update();
        let update_b = b.encode_state_as_update();
        a.apply_update(&update_b, UpdateOrigin::Remote).unwrap();
        b.apply_update(&update_a, UpdateOrigin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.encode_state_vector(), b.encode_state_vector());
        assert!(a.text().starts_with("A: "));
        assert!(a.text().ends_with('!'));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let source = Replica::new("doc-1");
        source.set_text("one two three");
        let update = source.encode_state_as_update();

        let target = Replica::new("doc-1");
        target.apply_update(&update, UpdateOrigin::Remote).unwrap();
        let once = (target.text(), target.encode_state_vector());

        target.apply_update(&update, UpdateOrigin::Remote).unwrap();
        assert_eq!((target.text(), target.encode_state_vector()), once);
    }

    #[test]
    fn test_encode_diff() {
        let a = Replica::new("doc-1");
        let b = Replica::new("doc-1");

        a.set_text("Initial content");
        b.apply_update(&a.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();
        let sv_b = b.encode_state_vector();

        a.insert(0, "NEW: ");
        let diff = a.encode_diff(&sv_b).unwrap();
        assert!(diff.len() < a.encode_state_as_update().len());

        b.apply_update(&diff, UpdateOrigin::Remote).unwrap();
        assert_eq!(b.text(), "NEW: Initial content");
    }

    #[test]
    fn test_would_change_detects_no_op() {
        let a = Replica::new("doc-1");
        a.set_text("same");
        let b = Replica::from_state("doc-1", &a.encode_state_as_update(), UpdateOrigin::Remote)
            .unwrap();

        assert!(!b.would_change(&a.encode_state_as_update()).unwrap());

        a.push(" and more");
        assert!(b.would_change(&a.encode_state_as_update()).unwrap());
        // Speculative check leaves the replica untouched
        assert_eq!(b.text(), "same");
    }

    #[test]
    fn test_would_change_rejects_garbage() {
        let replica = Replica::new("doc-1");
        assert!(replica.would_change(&[0xff, 0xff, 0xff]).is_err());
        assert!(replica.apply_update(&[0xff, 0xff, 0xff], UpdateOrigin::Remote).is_err());
    }

    #[test]
    fn test_local_observer_ignores_remote_origins() {
        let source = Replica::new("doc-1");
        source.set_text("from the server");

        let replica = Replica::new("doc-1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = replica
            .observe_local_changes(move |update| {
                seen_clone.lock().unwrap().push(update.to_vec());
            })
            .unwrap();

        replica
            .apply_update(&source.encode_state_as_update(), UpdateOrigin::ServerSubscription)
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        replica.push(" + local");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_observe_updates_reports_origin() {
        let replica = Replica::new("doc-1");
        let origins = Arc::new(Mutex::new(Vec::new()));
        let origins_clone = Arc::clone(&origins);
        let _sub = replica
            .observe_updates(move |_, origin| origins_clone.lock().unwrap().push(origin))
            .unwrap();

        replica.set_text("x");
        replica.set_text_with_origin("y", UpdateOrigin::ServerConflict);

        assert_eq!(
            *origins.lock().unwrap(),
            vec![UpdateOrigin::Local, UpdateOrigin::ServerConflict]
        );
    }
}
