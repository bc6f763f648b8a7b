// SPDX-License-Identifier: MPL-2.0

use crate::lock;
use crate::store::schema::SCHEMA;
use crate::store::{Persistence, PersistenceError};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DEFAULT_KEY: &str = "default";

/// Keeps the local state blob in a SQLite database.
#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
    key: String,
}

impl SqlitePersistence {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::Path(format!("failed to create state dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open the per-user database under the XDG data directory
    /// Path: ~/.local/share/listing-sync/state.db
    pub fn open_default() -> Result<Self, PersistenceError> {
        Self::open(&Self::default_path()?)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Scope reads and writes to another profile key within the same file.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        // Run migrations
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key: DEFAULT_KEY.to_string(),
        })
    }

    fn default_path() -> Result<PathBuf, PersistenceError> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| PersistenceError::Path("could not find data directory".to_string()))?;
        Ok(data_dir.join("listing-sync").join("state.db"))
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl Persistence for SqlitePersistence {
    fn read(&self) -> Result<Option<String>, PersistenceError> {
        let conn = lock(&self.conn);
        let blob = conn
            .query_row(
                "SELECT blob FROM local_state WHERE key = ?",
                [&self.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    fn write(&self, blob: &str) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn);
        conn.execute(
            r#"
            INSERT INTO local_state (key, blob, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                blob = excluded.blob,
                updated_at = excluded.updated_at
            "#,
            params![self.key, blob, Self::now()],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn);
        conn.execute("DELETE FROM local_state WHERE key = ?", [&self.key])?;
        Ok(())
    }
}
