//! `SQLite`-backed local store

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::LocalStore;
use crate::db::{Database, KvRepository, SqliteKvRepository};
use crate::error::Result;

/// Local store backed by a single `SQLite` database.
///
/// Batch writes run inside one transaction, so a crash keeps either the old
/// or the new values, never a mix.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    /// Open (or create) the store at the given filesystem path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub const fn from_database(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        // A panic mid-write rolls the transaction back, so the data is still consistent
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let db = self.lock();
        SqliteKvRepository::new(db.connection()).get(key)
    }

    fn write(&self, entries: &[(&str, String)]) -> Result<()> {
        let mut db = self.lock();
        let tx = db.connection_mut().transaction()?;
        {
            let repo = SqliteKvRepository::new(&tx);
            for (key, value) in entries {
                repo.put(key, value)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut db = self.lock();
        let tx = db.connection_mut().transaction()?;
        {
            let repo = SqliteKvRepository::new(&tx);
            for key in keys {
                repo.delete(key)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
