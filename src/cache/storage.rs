//! Cache storage backends: SQLite for persistence, memory for embedding and tests.

use chrono::{DateTime, Utc};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{CacheStorage, CachedEntry, EntryInfo};
use crate::error::StoreError;
use crate::http::{RequestDescriptor, Response};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at the default location.
  pub fn open_default() -> Result<Self, StoreError> {
    Self::open_path(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_path(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened cache database");
    Self::with_connection(conn)
  }

  /// Non-persistent store, mostly for tests.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, method, url),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);
"#;

const UPSERT_ENTRY: &str = "INSERT OR REPLACE INTO entries
   (generation, method, url, status, status_text, headers, body, body_sha256, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))";

fn generation_exists(conn: &Connection, generation: &str) -> Result<bool, StoreError> {
  let found = conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![generation],
      |_| Ok(()),
    )
    .optional()?;
  Ok(found.is_some())
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  request: &RequestDescriptor,
  response: &Response,
) -> Result<(), StoreError> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    UPSERT_ENTRY,
    params![
      generation,
      request.method.as_str(),
      request.url,
      response.status,
      response.status_text,
      headers,
      response.body(),
      body_digest(response.body()),
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<(), StoreError> {
    self.lock()?.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )?;
    Ok(())
  }

  fn contains(&self, generation: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    generation_exists(&conn, generation)
  }

  fn generations(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE generation = ?", params![generation])?;
    let removed = tx.execute("DELETE FROM generations WHERE name = ?", params![generation])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn lookup(
    &self,
    generation: &str,
    request: &RequestDescriptor,
  ) -> Result<Option<CachedEntry>, StoreError> {
    let conn = self.lock()?;
    let row: Option<(u16, String, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, body_sha256, cached_at FROM entries
         WHERE generation = ? AND method = ? AND url = ?",
        params![generation, request.method.as_str(), request.url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()?;

    let Some((status, status_text, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    if body_digest(&body) != digest {
      return Err(StoreError::Corrupt {
        url: request.url.clone(),
      });
    }

    let mut response = Response::new(status, body).with_status_text(status_text);
    response.headers = serde_json::from_str(&headers)?;

    Ok(Some(CachedEntry {
      response,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &Response,
  ) -> Result<(), StoreError> {
    let conn = self.lock()?;
    if !generation_exists(&conn, generation)? {
      return Err(StoreError::MissingGeneration(generation.to_string()));
    }
    insert_entry(&conn, generation, request, response)
  }

  fn put_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, Response)],
  ) -> Result<(), StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )?;
    for (request, response) in entries {
      insert_entry(&tx, generation, request, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn entries(&self, generation: &str) -> Result<Vec<EntryInfo>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT method, url, status, length(body), cached_at FROM entries
       WHERE generation = ? ORDER BY rowid",
    )?;

    let rows = stmt
      .query_map(params![generation], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u16>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, String>(4)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    rows
      .into_iter()
      .map(|(method, url, status, size, cached_at)| {
        let method: Method = method
          .parse()
          .map_err(|_| StoreError::Corrupt { url: url.clone() })?;
        Ok(EntryInfo {
          request: RequestDescriptor::new(method, url),
          status,
          size: usize::try_from(size).unwrap_or_default(),
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// Hex SHA-256 of a response body.
fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|_| StoreError::Timestamp(s.to_string()))
}

struct StoredEntry {
  request: RequestDescriptor,
  response: Response,
  cached_at: DateTime<Utc>,
}

/// Process-local storage; generations vanish with the process.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Vec<(String, Vec<StoredEntry>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<(String, Vec<StoredEntry>)>>, StoreError> {
    self
      .generations
      .lock()
      .map_err(|e| StoreError::LockPoisoned(e.to_string()))
  }
}

fn upsert(entries: &mut Vec<StoredEntry>, request: &RequestDescriptor, response: &Response) {
  let entry = StoredEntry {
    request: request.clone(),
    response: response.duplicate(),
    cached_at: Utc::now(),
  };
  match entries.iter_mut().find(|e| e.request == *request) {
    Some(existing) => *existing = entry,
    None => entries.push(entry),
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, generation: &str) -> Result<(), StoreError> {
    let mut generations = self.lock()?;
    if !generations.iter().any(|(name, _)| name == generation) {
      generations.push((generation.to_string(), Vec::new()));
    }
    Ok(())
  }

  fn contains(&self, generation: &str) -> Result<bool, StoreError> {
    Ok(self.lock()?.iter().any(|(name, _)| name == generation))
  }

  fn generations(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.lock()?.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete(&self, generation: &str) -> Result<bool, StoreError> {
    let mut generations = self.lock()?;
    let before = generations.len();
    generations.retain(|(name, _)| name != generation);
    Ok(generations.len() != before)
  }

  fn lookup(
    &self,
    generation: &str,
    request: &RequestDescriptor,
  ) -> Result<Option<CachedEntry>, StoreError> {
    let generations = self.lock()?;
    let found = generations
      .iter()
      .find(|(name, _)| name == generation)
      .and_then(|(_, entries)| entries.iter().find(|e| e.request == *request))
      .map(|e| CachedEntry {
        response: e.response.duplicate(),
        cached_at: e.cached_at,
      });
    Ok(found)
  }

  fn put(
    &self,
    generation: &str,
    request: &RequestDescriptor,
    response: &Response,
  ) -> Result<(), StoreError> {
    let mut generations = self.lock()?;
    let (_, entries) = generations
      .iter_mut()
      .find(|(name, _)| name == generation)
      .ok_or_else(|| StoreError::MissingGeneration(generation.to_string()))?;
    upsert(entries, request, response);
    Ok(())
  }

  fn put_all(
    &self,
    generation: &str,
    entries: &[(RequestDescriptor, Response)],
  ) -> Result<(), StoreError> {
    let mut generations = self.lock()?;
    let index = match generations.iter().position(|(name, _)| name == generation) {
      Some(index) => index,
      None => {
        generations.push((generation.to_string(), Vec::new()));
        generations.len() - 1
      }
    };
    let stored = &mut generations[index].1;
    for (request, response) in entries {
      upsert(stored, request, response);
    }
    Ok(())
  }

  fn entries(&self, generation: &str) -> Result<Vec<EntryInfo>, StoreError> {
    let generations = self.lock()?;
    let infos = generations
      .iter()
      .find(|(name, _)| name == generation)
      .map(|(_, entries)| {
        entries
          .iter()
          .map(|e| EntryInfo {
            request: e.request.clone(),
            status: e.response.status,
            size: e.response.body().len(),
            cached_at: e.cached_at,
          })
          .collect()
      })
      .unwrap_or_default();
    Ok(infos)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("sqlite", Box::new(SqliteStorage::open_in_memory().unwrap())),
      ("memory", Box::new(MemoryStorage::new())),
    ]
  }

  #[test]
  fn test_open_is_lazy_and_idempotent() {
    for (name, storage) in backends() {
      assert!(!storage.contains("v1").unwrap(), "{name}");
      storage.open("v1").unwrap();
      storage.open("v1").unwrap();
      storage.open("v2").unwrap();
      assert!(storage.contains("v1").unwrap(), "{name}");
      assert_eq!(storage.generations().unwrap(), vec!["v1", "v2"], "{name}");
    }
  }

  #[test]
  fn test_put_and_lookup_exact_match() {
    for (name, storage) in backends() {
      storage.open("v1").unwrap();
      let request = RequestDescriptor::get("/data.json");
      let response =
        Response::new(200, b"{\"a\":1}".to_vec()).with_header("content-type", "application/json");
      storage.put("v1", &request, &response).unwrap();

      let entry = storage.lookup("v1", &request).unwrap().expect(name);
      assert_eq!(entry.response, response, "{name}");

      assert!(storage.lookup("v1", &RequestDescriptor::get("data.json")).unwrap().is_none());
      assert!(storage
        .lookup("v1", &RequestDescriptor::new(Method::HEAD, "/data.json"))
        .unwrap()
        .is_none());
      assert!(storage.lookup("v2", &request).unwrap().is_none(), "{name}");
    }
  }

  #[test]
  fn test_put_requires_existing_generation() {
    for (name, storage) in backends() {
      let err = storage
        .put("gone", &RequestDescriptor::get("/a"), &Response::new(200, Vec::new()))
        .unwrap_err();
      assert!(matches!(err, StoreError::MissingGeneration(_)), "{name}");
      assert!(storage.generations().unwrap().is_empty(), "{name}");
    }
  }

  #[test]
  fn test_put_replaces_existing_key() {
    for (name, storage) in backends() {
      storage.open("v1").unwrap();
      let request = RequestDescriptor::get("/a");
      storage.put("v1", &request, &Response::new(200, b"old".to_vec())).unwrap();
      storage.put("v1", &request, &Response::new(200, b"new".to_vec())).unwrap();

      let entries = storage.entries("v1").unwrap();
      assert_eq!(entries.len(), 1, "{name}");
      assert_eq!(entries[0].size, 3);
      let entry = storage.lookup("v1", &request).unwrap().unwrap();
      assert_eq!(entry.response.into_body(), b"new".to_vec(), "{name}");
    }
  }

  #[test]
  fn test_put_all_creates_generation() {
    for (name, storage) in backends() {
      let entries = vec![
        (RequestDescriptor::get("/a"), Response::new(200, b"a".to_vec())),
        (RequestDescriptor::get("/b"), Response::new(200, b"b".to_vec())),
      ];
      storage.put_all("v9", &entries).unwrap();

      assert!(storage.contains("v9").unwrap(), "{name}");
      assert_eq!(storage.entries("v9").unwrap().len(), 2, "{name}");
    }
  }

  #[test]
  fn test_delete_removes_entries() {
    for (name, storage) in backends() {
      storage.open("v1").unwrap();
      storage
        .put("v1", &RequestDescriptor::get("/a"), &Response::new(200, b"a".to_vec()))
        .unwrap();

      assert!(storage.delete("v1").unwrap(), "{name}");
      assert!(!storage.delete("v1").unwrap(), "{name}");
      assert!(storage.entries("v1").unwrap().is_empty(), "{name}");

      // Reopening starts empty
      storage.open("v1").unwrap();
      assert!(storage.lookup("v1", &RequestDescriptor::get("/a")).unwrap().is_none());
    }
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open_path(&path).unwrap();
      storage.open("v2").unwrap();
      storage
        .put("v2", &RequestDescriptor::get("index.html"), &Response::new(200, b"<html>".to_vec()))
        .unwrap();
    }

    let storage = SqliteStorage::open_path(&path).unwrap();
    assert_eq!(storage.generations().unwrap(), vec!["v2"]);
    let entry = storage
      .lookup("v2", &RequestDescriptor::get("index.html"))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body(), b"<html>");
    assert_eq!(entry.response.status_text, "OK");
  }

  #[test]
  fn test_sqlite_detects_corrupt_body() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v1").unwrap();
    let request = RequestDescriptor::get("/a");
    storage.put("v1", &request, &Response::new(200, b"good".to_vec())).unwrap();

    storage
      .lock()
      .unwrap()
      .execute("UPDATE entries SET body = ?", params![b"evil".to_vec()])
      .unwrap();

    let err = storage.lookup("v1", &request).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { .. }));
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-01-15 10:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
