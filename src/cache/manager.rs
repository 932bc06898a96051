//! Generation lifecycle: creation, App Shell population, garbage collection.

use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::traits::{CacheStorage, CachedEntry, EntryInfo};
use crate::error::{CacheWriteError, GarbageCollectionError, ManifestError, StoreError};
use crate::http::{RequestDescriptor, Response};
use crate::network::Fetcher;

/// Outcome of a garbage collection pass.
#[derive(Debug, Default)]
pub struct GcReport {
  /// Generations that were deleted
  pub deleted: Vec<String>,
  /// Generations that could not be deleted
  pub failed: Vec<GarbageCollectionError>,
}

impl GcReport {
  pub fn is_clean(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Handle to one existing generation. Can read and write entries but cannot
/// create or delete generations.
pub struct Generation<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> Generation<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn lookup(&self, request: &RequestDescriptor) -> Result<Option<CachedEntry>, StoreError> {
    self.storage.lookup(&self.name, request)
  }

  /// Write one entry, applying the storability rules for runtime responses.
  pub fn put(
    &self,
    request: &RequestDescriptor,
    response: &Response,
  ) -> Result<(), CacheWriteError> {
    if !request.is_get() {
      return Err(CacheWriteError::UnsupportedMethod(request.method.to_string()));
    }
    if response.status == 206 {
      return Err(CacheWriteError::PartialContent);
    }
    self.storage.put(&self.name, request, response)?;
    Ok(())
  }

  pub fn entries(&self) -> Result<Vec<EntryInfo>, StoreError> {
    self.storage.entries(&self.name)
  }
}

impl<S: CacheStorage> Clone for Generation<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}

/// Owns creation and deletion of cache generations.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  controlling: AtomicBool,
}

impl<S: CacheStorage, F: Fetcher> CacheManager<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      controlling: AtomicBool::new(false),
    }
  }

  /// Handle to an existing generation, without creating it.
  pub fn generation(&self, name: &str) -> Generation<S> {
    Generation {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
    }
  }

  pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
    self.storage.contains(name)
  }

  /// All generation names, oldest first.
  pub fn generations(&self) -> Result<Vec<String>, StoreError> {
    self.storage.generations()
  }

  /// Fetch every manifest locator and store the responses in `generation`.
  ///
  /// All locators are fetched concurrently. The generation is created by the
  /// same batch that writes the entries, so it only appears once every fetch
  /// succeeded with a 2xx status. Existing keys are replaced, so repeating a
  /// populate is harmless.
  pub async fn populate(
    &self,
    generation: &str,
    manifest: &[String],
  ) -> Result<usize, ManifestError> {
    let mut seen = HashSet::new();
    if let Some(dup) = manifest.iter().find(|l| !seen.insert(l.as_str())) {
      return Err(ManifestError::Duplicate(dup.clone()));
    }

    info!(generation, count = manifest.len(), "pre-caching app shell");

    let fetches = manifest.iter().map(|locator| {
      let fetcher = Arc::clone(&self.fetcher);
      async move {
        let request = RequestDescriptor::get(locator.as_str());
        let response = fetcher
          .fetch(&request)
          .await
          .map_err(|source| ManifestError::Fetch {
            locator: locator.clone(),
            source,
          })?;

        if !response.ok() {
          return Err(ManifestError::Status {
            locator: locator.clone(),
            status: response.status,
          });
        }

        debug!(%locator, status = response.status, "fetched app shell entry");
        Ok((request, response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(generation, &entries)?;

    info!(generation, count = entries.len(), "app shell cached");
    Ok(entries.len())
  }

  /// Delete every generation except `current`.
  ///
  /// Each deletion is independent; failures are logged and reported, never raised.
  pub async fn collect_garbage(&self, current: &str) -> GcReport {
    let mut report = GcReport::default();

    let names = match self.storage.generations() {
      Ok(names) => names,
      Err(source) => {
        warn!(error = %source, "failed to enumerate cache generations");
        report.failed.push(GarbageCollectionError {
          generation: "*".to_string(),
          source,
        });
        return report;
      }
    };

    for name in names.into_iter().filter(|n| n != current) {
      match self.storage.delete(&name) {
        Ok(true) => {
          info!(generation = %name, "deleted stale cache generation");
          report.deleted.push(name);
        }
        Ok(false) => debug!(generation = %name, "stale generation already gone"),
        Err(source) => {
          warn!(generation = %name, error = %source, "failed to delete stale generation");
          report.failed.push(GarbageCollectionError {
            generation: name,
            source,
          });
        }
      }
    }

    report
  }

  /// Start controlling already-open pages without waiting for a reload.
  pub fn claim_control(&self) {
    if !self.controlling.swap(true, Ordering::SeqCst) {
      info!("claimed control of open clients");
    }
  }

  pub fn is_controlling(&self) -> bool {
    self.controlling.load(Ordering::SeqCst)
  }
}
