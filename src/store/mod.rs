//! Durable per-path cache of remote values.
//!
//! This module provides the persistent side of the sync engine:
//! - One `CacheEntry` per logical path, replaced on every write
//! - A write timestamp and TTL stored alongside the payload
//! - SQLite persistence, with an in-memory store for tests and degraded mode
//! - Bounded size: oldest entries by write time are evicted past a cap

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::PersistentStore;
