//! Error types for the audit log.

/// Errors that can occur while recording or reading audit events.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// A database operation failed.
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No connection could be checked out of the pool.
    #[error("audit pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization or deserialization failed.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The in-memory sink's lock was poisoned.
    #[error("audit sink lock poisoned")]
    LockPoisoned,
}
