//! Versioned response cache.
//!
//! This module provides the storage side of the agent:
//! - Named generations, each a keyed mapping from request to response
//! - SQLite persistence that survives restarts, plus an in-memory backend
//! - The `CacheManager`, sole owner of generation creation and deletion

pub mod manager;
mod storage;
mod traits;

pub use manager::{CacheManager, GcReport, Generation};
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheStorage, CachedEntry, EntryInfo, ResponseSource};
