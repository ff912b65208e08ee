use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for coedit operations
#[derive(Debug, Error)]
pub enum CoeditError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network offline")]
    Offline,

    // Sync errors
    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Remote store rejected update for document '{0}'")]
    Rejected(String),

    #[error("Document '{0}' has diverged from the remote copy and needs conflict resolution")]
    Conflict(String),

    #[error("Remote state for document '{0}' has not been initialized")]
    NotInitialized(String),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Local state for document '{doc_id}' is corrupted: {reason}")]
    Corruption { doc_id: String, reason: String },

    // Auth errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Recovery / format errors
    #[error("No recoverable content for document '{0}'")]
    RecoveryUnavailable(String),

    #[error("Invalid legacy content: {0}")]
    Format(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for coedit operations
pub type Result<T> = std::result::Result<T, CoeditError>;

/// Coarse error classes used to decide retry and surfacing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient transport failure, retried with backoff
    Network,
    /// Sync or conflict failure, retried up to a higher ceiling or resolved explicitly
    Sync,
    /// Local storage failure, triggers recovery or memory-only editing
    Persistence,
    /// Authentication or access failure, surfaced immediately
    Auth,
    /// Malformed content encountered while parsing recovery payloads
    Format,
    /// Invalid configuration
    Config,
    /// CRDT or other internal failure
    Internal,
}

impl CoeditError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoeditError::Network(_) | CoeditError::Timeout(_) | CoeditError::Offline => {
                ErrorKind::Network
            }
            CoeditError::Sync(_)
            | CoeditError::Rejected(_)
            | CoeditError::Conflict(_)
            | CoeditError::NotInitialized(_) => ErrorKind::Sync,
            CoeditError::Io(_) | CoeditError::Storage(_) | CoeditError::Corruption { .. } => {
                ErrorKind::Persistence
            }
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            CoeditError::Sqlite(_) => ErrorKind::Persistence,
            CoeditError::Unauthorized(_) => ErrorKind::Auth,
            CoeditError::RecoveryUnavailable(_) | CoeditError::Format(_) | CoeditError::Json(_) => {
                ErrorKind::Format
            }
            CoeditError::ConfigParse(_)
            | CoeditError::ConfigSerialize(_)
            | CoeditError::InvalidConfig(_) => ErrorKind::Config,
            CoeditError::Crdt(_) => ErrorKind::Internal,
        }
    }

    /// Whether the pipeline should retry the failed operation on its own.
    ///
    /// Network and sync failures are retried with backoff. Persistence, auth and
    /// format failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Sync)
            && !matches!(self, CoeditError::NotInitialized(_))
    }

    /// Whether this error signals unreadable local state (as opposed to an
    /// unavailable storage backend).
    pub fn is_corruption(&self) -> bool {
        matches!(self, CoeditError::Corruption { .. })
    }
}

/// A serializable representation of CoeditError for IPC (e.g., Tauri)
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error class
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Whether the pipeline retries this error itself
    pub retryable: bool,
}

impl From<&CoeditError> for SerializableError {
    fn from(err: &CoeditError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<CoeditError> for SerializableError {
    fn from(err: CoeditError) -> Self {
        SerializableError::from(&err)
    }
}

impl CoeditError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(CoeditError::Network("reset".into()).is_retryable());
        assert!(CoeditError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CoeditError::Rejected("doc".into()).is_retryable());
    }

    #[test]
    fn test_persistence_and_auth_errors_are_not_retryable() {
        let corruption = CoeditError::Corruption {
            doc_id: "doc-1".into(),
            reason: "bad header".into(),
        };
        assert_eq!(corruption.kind(), ErrorKind::Persistence);
        assert!(corruption.is_corruption());
        assert!(!corruption.is_retryable());
        assert!(!CoeditError::Unauthorized("token expired".into()).is_retryable());
        assert!(!CoeditError::NotInitialized("doc-1".into()).is_retryable());
    }

    #[test]
    fn test_serializable_error() {
        let err = CoeditError::Format("unexpected node".into());
        let serializable = err.to_serializable();
        assert_eq!(serializable.kind, ErrorKind::Format);
        assert_eq!(serializable.message, "Invalid legacy content: unexpected node");
        assert!(!serializable.retryable);
    }
}
