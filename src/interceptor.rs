//! Cache-first request interception with network fallback and write-back.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cache::{CacheStorage, Generation, ResponseSource};
use crate::config::AgentConfig;
use crate::error::FetchError;
use crate::http::{RequestDescriptor, Response};
use crate::network::Fetcher;

/// What happened to one intercepted request.
#[derive(Debug)]
pub enum Interception {
  /// Not intercepted; the host handles the request with its default networking
  Bypass,
  /// The agent supplied a response
  Responded {
    response: Response,
    source: ResponseSource,
  },
  /// Network failed and nothing could stand in for it
  Failed(FetchError),
}

impl Interception {
  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      Self::Responded { source, .. } => Some(*source),
      _ => None,
    }
  }

  pub fn is_bypass(&self) -> bool {
    matches!(self, Self::Bypass)
  }
}

/// Applies the agent's request policy against the current generation.
///
/// Holds only a [`Generation`] handle, so it can read and write entries but
/// never create or delete a generation.
pub struct Interceptor<S: CacheStorage, F: Fetcher> {
  config: Arc<AgentConfig>,
  current: Generation<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> Interceptor<S, F> {
  pub fn new(config: Arc<AgentConfig>, current: Generation<S>, fetcher: Arc<F>) -> Self {
    Self {
      config,
      current,
      fetcher,
    }
  }

  /// Resolve one request.
  ///
  /// 1. Bypass patterns skip the cache entirely
  /// 2. A cache hit is returned without touching the network
  /// 3. A miss is fetched; the response is duplicated and one copy written back
  /// 4. A failed fetch falls back to the configured offline entry, if cached
  pub async fn handle(&self, request: &RequestDescriptor) -> Interception {
    if self.config.is_bypassed(&request.url) {
      debug!(%request, "bypassing interception");
      return Interception::Bypass;
    }

    if let Some(response) = self.lookup(request) {
      debug!(%request, "cache hit");
      return Interception::Responded {
        response,
        source: ResponseSource::Cache,
      };
    }

    debug!(%request, "cache miss, fetching");
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        let copy = response.duplicate();
        if let Err(e) = self.current.put(request, &copy) {
          debug!(%request, error = %e, "response not written back");
        }
        Interception::Responded {
          response,
          source: ResponseSource::Network,
        }
      }
      Err(e) => {
        error!(%request, error = %e, "fetch failed");
        match self.fallback() {
          Some(response) => Interception::Responded {
            response,
            source: ResponseSource::Fallback,
          },
          None => Interception::Failed(e),
        }
      }
    }
  }

  /// A failed lookup counts as a miss.
  fn lookup(&self, request: &RequestDescriptor) -> Option<Response> {
    match self.current.lookup(request) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(%request, error = %e, "cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn fallback(&self) -> Option<Response> {
    let locator = self.config.offline_fallback.as_deref()?;
    let response = self.lookup(&RequestDescriptor::get(locator))?;
    debug!(%locator, "serving offline fallback");
    Some(response)
  }
}
