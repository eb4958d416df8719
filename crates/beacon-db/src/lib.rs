//! Storage layer for the beacon mesh.
//!
//! Provides the SQLite connection pool (via `r2d2`), embedded migrations for
//! every mesh table, and the durable key-value settings store.
//!
//! - **SQLite in WAL mode**: a beacon is a single process with many readers
//!   and short writes; no external database is needed.
//! - **Embedded migrations**: SQL files are compiled in with `include_str!`
//!   so the schema ships with the binary.

mod kv;
mod migrations;
mod pool;

pub use kv::{KeyValueStore, KvError, MemoryKvStore, SqliteKvStore};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, open_database, DbPool, PoolError, PoolSettings};
