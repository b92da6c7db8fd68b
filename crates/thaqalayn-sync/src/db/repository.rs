//! Key/value repository for persisted sync state

use crate::error::Result;
use crate::util::now_millis;
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for key/value storage operations
pub trait KvRepository {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value stored under `key`
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key` if present
    fn delete(&self, key: &str) -> Result<()>;
}

/// `SQLite` implementation of `KvRepository`
///
/// Works on a plain connection or on a transaction (which derefs to one).
pub struct SqliteKvRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteKvRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl KvRepository for SqliteKvRepository<'_> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_millis()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_entries WHERE key = ?", params![key])?;
        Ok(())
    }
}
