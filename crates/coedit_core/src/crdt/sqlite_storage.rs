//! SQLite-backed storage implementation for CRDT persistence.
//!
//! This module provides a persistent storage backend using SQLite for storing
//! replica snapshots, their incremental update log, and the offline queue.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{CrdtStorage, StorageResult, fold_updates};
use super::types::{CrdtUpdate, UpdateOrigin};
use super::update::state_vector_of;

/// SQLite-backed CRDT storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Document snapshots (compacted state)
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                state_vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Incremental updates since the last compaction
            -- Note: No foreign key constraint since updates may arrive before document snapshot
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);

            -- Pending offline operations, serialized as one JSON document per replica
            CREATE TABLE IF NOT EXISTS offline_queue (
                doc_name TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl CrdtStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        // An undecodable state is still stored; opening it reports corruption.
        let state_vector = state_vector_of(state).unwrap_or_default();

        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![name, state, state_vector, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        tx.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        tx.execute("DELETE FROM offline_queue WHERE doc_name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM documents UNION SELECT doc_name FROM updates ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    fn append_update(
        &self,
        name: &str,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![name, update, origin.as_str(), now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<CrdtUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE doc_name = ?
             ORDER BY id ASC",
        )?;

        let updates = stmt
            .query_map(params![name], |row| {
                let origin_str: String = row.get(2)?;
                Ok(CrdtUpdate {
                    update_id: row.get(0)?,
                    doc_name: name.to_string(),
                    data: row.get(1)?,
                    timestamp: row.get(3)?,
                    origin: origin_str.parse().unwrap_or(UpdateOrigin::Local),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(updates)
    }

    fn compact(&self, name: &str) -> StorageResult<()> {
        let snapshot = self.load_doc(name)?;
        let updates = self.get_all_updates(name)?;
        let Some(last_id) = updates.last().map(|u| u.update_id) else {
            return Ok(());
        };
        let Some(full_state) = fold_updates(snapshot, &updates)? else {
            return Ok(());
        };

        let state_vector = state_vector_of(&full_state)?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Snapshot first, then drop the folded updates, in one transaction
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![name, full_state, state_vector, now],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_name = ? AND id <= ?",
            params![name, last_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn save_offline_queue(&self, name: &str, queue: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO offline_queue (doc_name, data, updated_at) VALUES (?, ?, ?)",
            params![name, queue, now],
        )?;
        Ok(())
    }

    fn load_offline_queue(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let data = conn
            .query_row(
                "SELECT data FROM offline_queue WHERE doc_name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }
}
