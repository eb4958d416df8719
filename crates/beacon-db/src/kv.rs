//! Durable key-value settings.
//!
//! Generated secrets and flags (the signing key, the identity record, the
//! registered proxy route) live behind [`KeyValueStore`] so that services
//! receive the store by injection and tests can swap in [`MemoryKvStore`].

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::DbPool;

/// Errors raised by key-value stores.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("settings database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("settings pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("settings store lock poisoned")]
    LockPoisoned,
}

/// A durable string-to-string map.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Stores `value` only when `key` is absent. Returns whether it was written.
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError>;
}

/// [`KeyValueStore`] backed by the `settings` table.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: DbPool,
}

impl SqliteKvStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            params![key, value],
        )?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![key, value],
        )?;
        Ok(inserted == 1)
    }
}

/// In-process [`KeyValueStore`] for tests and ephemeral beacons.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().map_err(|_| KvError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().map_err(|_| KvError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().map_err(|_| KvError::LockPoisoned)?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}
