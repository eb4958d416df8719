//! Per-key mutual exclusion.
//!
//! Invite redemption serializes per `invite_id` and peer writes per
//! fingerprint. Identity-provider calls that create an object under a
//! peer's slug serialize per fingerprint across `.await` points, so they
//! use the async table. Unrelated keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A table of lazily created mutexes, one per key.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex guarding `key`, creating it on first use.
    ///
    /// Entries nobody else holds are dropped on the way, so the table only
    /// grows with the number of keys in flight.
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = match self.inner.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|t| t.len()).unwrap_or(0)
    }
}

/// Like [`KeyedLocks`], but the guard may be held across `.await`.
#[derive(Debug, Default)]
pub struct AsyncKeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AsyncKeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = match self.inner.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            table.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}
