//! Error types for the caching agent.
//!
//! Each failure class maps to one enum so callers can decide what is fatal:
//! manifest errors fail an install, everything raised while serving requests is
//! logged and degraded to ordinary request failure.

use thiserror::Error;

use crate::agent::Phase;

/// Failure to fetch a resource from the network.
#[derive(Error, Debug)]
pub enum FetchError {
  #[error("invalid request url {url}: {source}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("network error for {url}: {source}")]
  Network {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{url} is unreachable: {reason}")]
  Unreachable { url: String, reason: String },
}

/// Failure inside a cache store backend.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("generation {0} does not exist")]
  MissingGeneration(String),

  #[error("stored body for {url} failed its integrity check")]
  Corrupt { url: String },

  #[error("invalid timestamp '{0}'")]
  Timestamp(String),

  #[error("could not determine data directory")]
  NoDataDir,
}

/// Failure to pre-cache the App Shell. Fails the install phase.
#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("failed to fetch {locator}: {source}")]
  Fetch {
    locator: String,
    #[source]
    source: FetchError,
  },

  #[error("{locator} returned status {status}")]
  Status { locator: String, status: u16 },

  #[error("{0} is listed more than once")]
  Duplicate(String),

  #[error("failed to store pre-cached entries: {0}")]
  Store(#[from] StoreError),
}

/// Failure to delete one stale generation. Never fatal.
#[derive(Error, Debug)]
#[error("failed to delete generation {generation}: {source}")]
pub struct GarbageCollectionError {
  pub generation: String,
  #[source]
  pub source: StoreError,
}

/// A write-back that did not happen. Logged, never surfaced to the caller.
#[derive(Error, Debug)]
pub enum CacheWriteError {
  #[error("only GET requests are stored, got {0}")]
  UnsupportedMethod(String),

  #[error("partial content responses are not stored")]
  PartialContent,

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Top-level error for lifecycle operations.
#[derive(Error, Debug)]
pub enum AgentError {
  #[error("install failed: {0}")]
  Install(#[from] ManifestError),

  #[error("cannot {action} while {actual:?}")]
  InvalidTransition { action: &'static str, actual: Phase },

  #[error("host stopped before {0} completed")]
  HostStopped(&'static str),

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
