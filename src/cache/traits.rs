//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::http::{RequestDescriptor, Response};

/// A response read back from a generation.
#[derive(Debug)]
pub struct CachedEntry {
  /// The stored response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Summary of one stored entry, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
  pub request: RequestDescriptor,
  pub status: u16,
  pub size: usize,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations, each a keyed mapping from
/// request descriptor to response. Implementations must make every single
/// call atomic; no cross-call transactions are assumed.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<(), StoreError>;

  /// Whether the generation exists.
  fn contains(&self, generation: &str) -> Result<bool, StoreError>;

  /// All generation names, oldest first.
  fn generations(&self) -> Result<Vec<String>, StoreError>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete(&self, generation: &str) -> Result<bool, StoreError>;

  /// Exact-match lookup.
  fn lookup(
    &self,
    generation: &str,
    request: &RequestDescriptor,
  ) -> Result<Option<CachedEntry>, StoreError>;

  /// Insert or replace one entry. The generation must exist.
  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &Response,
  ) -> Result<(), StoreError>;

  /// Create the generation if needed and insert or replace several entries
  /// in it. Either the generation and every entry are written, or nothing is.
  fn put_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, Response)],
  ) -> Result<(), StoreError>;

  /// Entries of a generation, in insertion order.
  fn entries(&self, generation: &str) -> Result<Vec<EntryInfo>, StoreError>;
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Found in the current generation
  Cache,
  /// Fetched from the network on a miss
  Network,
  /// Network failed, configured fallback entry served instead
  Fallback,
}
