//! The [`StateStore`] abstraction and its SQLite implementation.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Key-value storage partitioned by scope.
///
/// Implementations must be usable from any thread; the engine holds them as
/// `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    fn load(&self, scope: &str, key: &str) -> Result<Option<String>>;

    fn save(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    /// Returns whether a value was present.
    fn remove(&self, scope: &str, key: &str) -> Result<bool>;

    /// Drop every key of a scope. Returns the number of removed entries.
    fn clear_scope(&self, scope: &str) -> Result<usize>;
}

/// Typed JSON helpers available on every [`StateStore`].
pub trait StateStoreExt: StateStore {
    fn load_json<T: DeserializeOwned>(&self, scope: &str, key: &str) -> Result<Option<T>> {
        match self.load(scope, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, scope: &str, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.save(scope, key, &raw)
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// [`StateStore`] on top of a [`Database`].
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::open_default()?))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&db)
    }

    /// Delete entries not written since `cutoff`. Returns how many went.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_db(|db| {
            let removed = db.conn().execute(
                "DELETE FROM scoped_state WHERE updated_at < ?1",
                params![cutoff.to_rfc3339()],
            )?;
            if removed > 0 {
                tracing::info!(removed, "pruned stale scoped state");
            }
            Ok(removed)
        })
    }
}

impl StateStore for SqliteStore {
    fn load(&self, scope: &str, key: &str) -> Result<Option<String>> {
        self.with_db(|db| {
            let value = db
                .conn()
                .query_row(
                    "SELECT value FROM scoped_state WHERE scope = ?1 AND key = ?2",
                    params![scope, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn save(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.with_db(|db| {
            db.conn().execute(
                "INSERT INTO scoped_state (scope, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(scope, key) DO UPDATE
                 SET value = excluded.value, updated_at = excluded.updated_at",
                params![scope, key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn remove(&self, scope: &str, key: &str) -> Result<bool> {
        self.with_db(|db| {
            let affected = db.conn().execute(
                "DELETE FROM scoped_state WHERE scope = ?1 AND key = ?2",
                params![scope, key],
            )?;
            Ok(affected > 0)
        })
    }

    fn clear_scope(&self, scope: &str) -> Result<usize> {
        self.with_db(|db| {
            let affected = db
                .conn()
                .execute("DELETE FROM scoped_state WHERE scope = ?1", params![scope])?;
            Ok(affected)
        })
    }
}
