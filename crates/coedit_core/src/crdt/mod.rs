//! CRDT layer: the replicated document state and its local persistence.
//!
//! A [`Replica`] wraps a yrs document holding one document's linear text.
//! Every mutation is tagged with an [`UpdateOrigin`]; only local edits are
//! offered to the sync pipeline. [`LocalPersistence`] mirrors a replica into a
//! [`CrdtStorage`] backend, and [`update`] holds the update-level primitives
//! (merge, diff, divergence) used by batching and reconciliation.

mod memory_storage;
mod persistence;
mod replica;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;
mod types;
pub mod update;

pub use memory_storage::MemoryStorage;
pub use persistence::{LocalPersistence, PersistenceStatus};
pub use replica::{CONTENT_TEXT_NAME, Replica};
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{CrdtStorage, StorageResult};
pub use types::{CrdtUpdate, UpdateOrigin};
pub use update::{Divergence, compare_states, merge_updates};
