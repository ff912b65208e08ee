//! Cloud recovery of corrupted local replicas.
//!
//! When stored state cannot be decoded, the document is rebuilt from the
//! remote store in this order:
//!
//! 1. the remote binary snapshot, applied to a fresh replica;
//! 2. legacy text from earlier, non-CRDT versions of the document;
//! 3. nothing recoverable: the caller gets
//!    [`CoeditError::RecoveryUnavailable`] and may fall back to
//!    [`CloudRecovery::placeholder`].
//!
//! The rebuilt replica is transient. It is merged into the live replica with
//! origin [`UpdateOrigin::Recovery`] and dropped.
//!
//! A placeholder only holds the editor in a usable state. Once the remote
//! content reaches the replica, [`CloudRecovery::clear_placeholder`] deletes
//! the notice again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::crdt::{Replica, UpdateOrigin};
use crate::error::{CoeditError, Result};
use crate::remote::RemoteStore;

/// Content of a placeholder replica.
pub const RECOVERY_NOTICE: &str = "This document could not be loaded on this device. \
The original content is safe on the server and will be restored automatically \
once the server can be reached.";

/// Where a recovered document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum RecoverySource {
    /// The remote binary CRDT snapshot
    BinarySnapshot,
    /// Legacy text re-encoded into a new replica
    LegacyText,
    /// Nothing was recoverable; the replica holds [`RECOVERY_NOTICE`]
    Placeholder,
}

/// A transient replica rebuilt by [`CloudRecovery`].
pub struct RecoveredDocument {
    /// The rebuilt content
    pub replica: Replica,
    /// Which fallback produced it
    pub source: RecoverySource,
}

/// Text stored by pre-CRDT versions of a document.
///
/// Either a plain string or a rich-text node tree such as
/// `{"type": "doc", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "Hi"}]}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyText {
    /// Plain text, used as-is
    Plain(String),
    /// A node tree, flattened depth-first
    Structured(LegacyNode),
}

/// One node of a legacy rich-text tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyNode {
    /// Node type (`doc`, `paragraph`, `text`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Text of a leaf node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Child nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<LegacyNode>,
}

impl LegacyText {
    /// Parse legacy content as stored in JSON.
    ///
    /// # Errors
    ///
    /// [`CoeditError::Format`] if the payload is neither a string nor a node tree.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoeditError::Format(e.to_string()))
    }

    /// Flatten to plain text. Top-level blocks of a tree are separated by `\n`.
    pub fn to_plain_text(&self) -> String {
        match self {
            LegacyText::Plain(text) => text.clone(),
            LegacyText::Structured(root) if root.content.is_empty() => {
                root.text.clone().unwrap_or_default()
            }
            LegacyText::Structured(root) => root
                .content
                .iter()
                .map(|block| {
                    let mut out = String::new();
                    collect_text(block, &mut out);
                    out
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn collect_text(node: &LegacyNode, out: &mut String) {
    if let Some(text) = &node.text {
        out.push_str(text);
    }
    for child in &node.content {
        collect_text(child, out);
    }
}

/// Rebuilds documents from the remote store.
#[derive(Clone)]
pub struct CloudRecovery {
    remote: Arc<dyn RemoteStore>,
}

impl CloudRecovery {
    /// Create a recovery service backed by `remote`.
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    /// Rebuild `doc_id` from the remote store.
    ///
    /// A binary snapshot that fails to decode falls through to legacy text.
    ///
    /// # Errors
    ///
    /// - [`CoeditError::RecoveryUnavailable`] if the remote has nothing usable.
    /// - Any error from the remote store itself.
    pub async fn recover(&self, doc_id: &str) -> Result<RecoveredDocument> {
        log::info!("[CloudRecovery] Recovering '{}' from remote", doc_id);

        let Some(snapshot) = self.remote.get_recovery_snapshot(doc_id).await? else {
            log::warn!("[CloudRecovery] Remote has no recovery data for '{}'", doc_id);
            return Err(CoeditError::RecoveryUnavailable(doc_id.to_string()));
        };

        if let Some(binary) = snapshot.binary_snapshot.as_deref() {
            match Replica::from_state(doc_id, binary, UpdateOrigin::Recovery) {
                Ok(replica) => {
                    log::info!(
                        "[CloudRecovery] Restored '{}' from binary snapshot ({} bytes)",
                        doc_id,
                        binary.len()
                    );
                    return Ok(RecoveredDocument {
                        replica,
                        source: RecoverySource::BinarySnapshot,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "[CloudRecovery] Binary snapshot for '{}' is unusable: {}",
                        doc_id,
                        e
                    );
                }
            }
        }

        if let Some(legacy) = &snapshot.legacy_text {
            let replica = Replica::new(doc_id);
            replica.set_text_with_origin(&legacy.to_plain_text(), UpdateOrigin::Recovery);
            log::info!("[CloudRecovery] Restored '{}' from legacy text", doc_id);
            return Ok(RecoveredDocument {
                replica,
                source: RecoverySource::LegacyText,
            });
        }

        Err(CoeditError::RecoveryUnavailable(doc_id.to_string()))
    }

    /// A replica holding [`RECOVERY_NOTICE`].
    pub fn placeholder(doc_id: &str) -> RecoveredDocument {
        let replica = Replica::new(doc_id);
        replica.set_text_with_origin(RECOVERY_NOTICE, UpdateOrigin::Recovery);
        RecoveredDocument {
            replica,
            source: RecoverySource::Placeholder,
        }
    }

    /// Whether `replica` still shows [`RECOVERY_NOTICE`].
    pub fn holds_placeholder(replica: &Replica) -> bool {
        replica.text().contains(RECOVERY_NOTICE)
    }

    /// Delete [`RECOVERY_NOTICE`] from `replica` with origin
    /// [`UpdateOrigin::Recovery`]. Everything else is left as is.
    ///
    /// Returns `true` if a notice was removed.
    pub fn clear_placeholder(replica: &Replica) -> bool {
        let text = replica.text();
        if !text.contains(RECOVERY_NOTICE) {
            return false;
        }
        replica.set_text_with_origin(&text.replace(RECOVERY_NOTICE, ""), UpdateOrigin::Recovery);
        log::info!(
            "[CloudRecovery] Removed recovery placeholder from '{}'",
            replica.doc_id()
        );
        true
    }

    /// Merge a recovered document into `target` and discard it.
    pub fn merge_into(target: &Replica, recovered: RecoveredDocument) -> Result<RecoverySource> {
        let diff = recovered
            .replica
            .encode_diff(&target.encode_state_vector())?;
        target.apply_update(&diff, UpdateOrigin::Recovery)?;
        Ok(recovered.source)
    }

    /// Recover `target`'s document and merge the result into it, using the
    /// placeholder when nothing is recoverable or the remote is unreachable.
    pub async fn recover_into(&self, target: &Replica) -> Result<RecoverySource> {
        let recovered = match self.recover(target.doc_id()).await {
            Ok(recovered) => recovered,
            Err(e) => {
                log::warn!(
                    "[CloudRecovery] Falling back to placeholder for '{}': {}",
                    target.doc_id(),
                    e
                );
                Self::placeholder(target.doc_id())
            }
        };
        Self::merge_into(target, recovered)
    }
}

impl std::fmt::Debug for CloudRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudRecovery").finish_non_exhaustive()
    }
}
