#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Update batching (debounce, size and max-wait flushing)
pub mod batcher;

/// Configuration options
pub mod config;

/// Connection state machine with backoff
pub mod connection;

/// CRDT replica, storage and local persistence
pub mod crdt;

/// Per-document sync engine
pub mod engine;

/// Error (common error types)
pub mod error;

/// Network reachability
pub mod network;

/// Offline operation queue and conflict resolution
pub mod offline;

/// Cloud recovery of corrupted replicas
pub mod recovery;

/// Shared replica registry
pub mod registry;

/// Remote store contract
pub mod remote;

/// Cancellable timers
pub mod scheduler;

/// Sync counters
pub mod stats;

pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use crdt::{Replica, UpdateOrigin};
pub use engine::{SyncEngine, SyncStatus};
pub use error::{CoeditError, Result};
pub use network::NetworkMonitor;
pub use offline::{ConflictStrategy, OfflineMode};
pub use registry::ReplicaRegistry;
pub use remote::RemoteStore;
