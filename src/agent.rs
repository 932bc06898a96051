//! Lifecycle state machine driving the cache manager and the interceptor.
//!
//! The host moves an agent through `Installing → Activating → Serving`. Each
//! transition is an async function the host awaits before it allows the next
//! phase. A failed install leaves the agent `Redundant`; the host retries with
//! a fresh agent on its next install attempt.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::cache::{CacheManager, CacheStorage, GcReport};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::http::RequestDescriptor;
use crate::interceptor::{Interception, Interceptor};
use crate::network::Fetcher;

/// Lifecycle phase of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Registered; the App Shell still has to be pre-cached
  Installing,
  /// Installed; stale generations still have to be collected
  Activating,
  /// Handling requests
  Serving,
  /// Install failed; this agent will never serve
  Redundant,
}

/// An offline caching agent for one configured generation.
pub struct Agent<S: CacheStorage, F: Fetcher> {
  config: Arc<AgentConfig>,
  manager: CacheManager<S, F>,
  interceptor: Interceptor<S, F>,
  phase: watch::Sender<Phase>,
  /// Serialises lifecycle transitions
  transition: Mutex<()>,
}

impl<S: CacheStorage, F: Fetcher> Agent<S, F> {
  pub fn new(config: AgentConfig, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    let config = Arc::new(config);
    let manager = CacheManager::new(storage, Arc::clone(&fetcher));
    let interceptor = Interceptor::new(
      Arc::clone(&config),
      manager.generation(&config.generation),
      fetcher,
    );
    let (phase, _) = watch::channel(Phase::Installing);

    Self {
      config,
      manager,
      interceptor,
      phase,
      transition: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  pub fn manager(&self) -> &CacheManager<S, F> {
    &self.manager
  }

  pub fn phase(&self) -> Phase {
    *self.phase.borrow()
  }

  /// Receiver notified on every phase change.
  pub fn subscribe(&self) -> watch::Receiver<Phase> {
    self.phase.subscribe()
  }

  fn expect_phase(&self, expected: Phase, action: &'static str) -> Result<()> {
    let actual = self.phase();
    if actual == expected {
      Ok(())
    } else {
      Err(AgentError::InvalidTransition { action, actual })
    }
  }

  fn set_phase(&self, phase: Phase) {
    self.phase.send_replace(phase);
  }

  /// Pre-cache the App Shell into the current generation.
  ///
  /// On failure the agent becomes [`Phase::Redundant`].
  pub async fn install(&self) -> Result<usize> {
    let _guard = self.transition.lock().await;
    self.expect_phase(Phase::Installing, "install")?;
    info!(generation = %self.config.generation, "installing");

    match self
      .manager
      .populate(&self.config.generation, &self.config.manifest)
      .await
    {
      Ok(count) => {
        self.set_phase(Phase::Activating);
        Ok(count)
      }
      Err(e) => {
        error!(error = %e, "failed to cache app shell");
        self.set_phase(Phase::Redundant);
        Err(e.into())
      }
    }
  }

  /// Remove stale generations, claim open clients, then start serving.
  ///
  /// Garbage collection failures do not block activation.
  pub async fn activate(&self) -> Result<GcReport> {
    let _guard = self.transition.lock().await;
    self.expect_phase(Phase::Activating, "activate")?;
    info!(generation = %self.config.generation, "activating");
    Ok(self.take_over().await)
  }

  async fn take_over(&self) -> GcReport {
    let report = self.manager.collect_garbage(&self.config.generation).await;
    if !report.is_clean() {
      warn!(failed = report.failed.len(), "some stale generations were not deleted");
    }

    self.manager.claim_control();
    self.set_phase(Phase::Serving);
    report
  }

  /// Install then activate.
  pub async fn start(&self) -> Result<(usize, GcReport)> {
    let cached = self.install().await?;
    let report = self.activate().await?;
    Ok((cached, report))
  }

  /// Resume serving from a generation installed by an earlier process.
  ///
  /// A generation only exists once its install completed, so finding it skips
  /// straight to activation. Returns `None`, leaving the agent in
  /// `Installing`, when the current generation does not exist yet.
  pub async fn restore(&self) -> Result<Option<GcReport>> {
    let _guard = self.transition.lock().await;
    self.expect_phase(Phase::Installing, "restore")?;

    if !self.manager.exists(&self.config.generation)? {
      return Ok(None);
    }

    info!(generation = %self.config.generation, "restoring installed generation");
    Ok(Some(self.take_over().await))
  }

  /// Handle one outbound request. Requests reaching an agent that is not
  /// serving yet are left to the host.
  pub async fn handle_fetch(&self, request: &RequestDescriptor) -> Interception {
    if self.phase() != Phase::Serving {
      return Interception::Bypass;
    }
    self.interceptor.handle(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::manager::tests::StubFetcher;
  use crate::cache::{MemoryStorage, ResponseSource, SqliteStorage};
  use crate::error::ManifestError;

  fn config(generation: &str, manifest: &[&str]) -> AgentConfig {
    AgentConfig {
      generation: generation.to_string(),
      manifest: manifest.iter().map(|s| s.to_string()).collect(),
      bypass_patterns: vec!["generativelanguage.googleapis.com".to_string()],
      offline_fallback: None,
    }
  }

  fn shell_fetcher() -> Arc<StubFetcher> {
    Arc::new(StubFetcher::with(&[
      ("/index.html", 200, "<html>"),
      ("/logo.png", 200, "png"),
      ("/data.json", 200, "{\"a\":1}"),
    ]))
  }

  #[tokio::test]
  async fn test_install_populates_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let agent = Agent::new(
      config("v2", &["/index.html", "/logo.png"]),
      storage.clone(),
      shell_fetcher(),
    );

    let cached = agent.install().await.unwrap();

    assert_eq!(cached, 2);
    assert_eq!(agent.phase(), Phase::Activating);
    let keys: Vec<String> = storage
      .entries("v2")
      .unwrap()
      .into_iter()
      .map(|e| e.request.url)
      .collect();
    assert_eq!(keys, vec!["/index.html", "/logo.png"]);
  }

  #[tokio::test]
  async fn test_failed_install_is_redundant() {
    let agent = Agent::new(
      config("v2", &["/index.html", "/missing.png"]),
      Arc::new(MemoryStorage::new()),
      shell_fetcher(),
    );
    let mut phases = agent.subscribe();

    let err = agent.install().await.unwrap_err();

    assert!(matches!(err, AgentError::Install(ManifestError::Fetch { .. })));
    assert_eq!(agent.phase(), Phase::Redundant);
    assert!(phases.has_changed().unwrap());
    assert_eq!(*phases.borrow_and_update(), Phase::Redundant);
    assert!(!agent.manager().exists("v2").unwrap());

    let err = agent.activate().await.unwrap_err();
    assert!(matches!(
      err,
      AgentError::InvalidTransition {
        actual: Phase::Redundant,
        ..
      }
    ));

    // Not serving, so requests go to the host
    let result = agent.handle_fetch(&RequestDescriptor::get("/index.html")).await;
    assert!(result.is_bypass());
  }

  #[tokio::test]
  async fn test_activate_collects_stale_generations() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    let agent = Agent::new(config("v2", &["/index.html"]), storage.clone(), shell_fetcher());

    let (_, report) = agent.start().await.unwrap();

    assert_eq!(report.deleted, vec!["v1"]);
    assert_eq!(storage.generations().unwrap(), vec!["v2"]);
    assert_eq!(agent.phase(), Phase::Serving);
    assert!(agent.manager().is_controlling());
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let agent = Agent::new(config("v2", &[]), Arc::new(MemoryStorage::new()), shell_fetcher());
    let err = agent.activate().await.unwrap_err();
    assert!(matches!(
      err,
      AgentError::InvalidTransition {
        action: "activate",
        actual: Phase::Installing
      }
    ));
  }

  #[tokio::test]
  async fn test_requests_before_activation_are_bypassed() {
    let fetcher = shell_fetcher();
    let agent = Agent::new(
      config("v2", &["/index.html"]),
      Arc::new(MemoryStorage::new()),
      fetcher.clone(),
    );
    agent.install().await.unwrap();
    let calls = fetcher.calls();

    let result = agent.handle_fetch(&RequestDescriptor::get("/data.json")).await;

    assert!(result.is_bypass());
    assert_eq!(fetcher.calls(), calls);
  }

  #[tokio::test]
  async fn test_serving_round_trip() {
    let fetcher = shell_fetcher();
    let agent = Agent::new(
      config("v2", &["/index.html"]),
      Arc::new(MemoryStorage::new()),
      fetcher.clone(),
    );
    agent.start().await.unwrap();
    let after_install = fetcher.calls();

    let shell = agent.handle_fetch(&RequestDescriptor::get("/index.html")).await;
    assert_eq!(shell.source(), Some(ResponseSource::Cache));
    assert_eq!(fetcher.calls(), after_install);

    let data = agent.handle_fetch(&RequestDescriptor::get("/data.json")).await;
    assert_eq!(data.source(), Some(ResponseSource::Network));
    let data = agent.handle_fetch(&RequestDescriptor::get("/data.json")).await;
    assert_eq!(data.source(), Some(ResponseSource::Cache));
    assert_eq!(fetcher.calls(), after_install + 1);
  }

  #[tokio::test]
  async fn test_restore_requires_existing_generation() {
    let storage = Arc::new(MemoryStorage::new());
    let agent = Agent::new(config("v2", &["/index.html"]), storage.clone(), shell_fetcher());
    assert!(agent.restore().await.unwrap().is_none());
    assert_eq!(agent.phase(), Phase::Installing);

    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    let agent = Agent::new(config("v2", &["/index.html"]), storage.clone(), shell_fetcher());
    let report = agent.restore().await.unwrap().unwrap();
    assert_eq!(report.deleted, vec!["v1"]);
    assert_eq!(storage.generations().unwrap(), vec!["v2"]);
    assert_eq!(agent.phase(), Phase::Serving);
    assert!(agent.manager().is_controlling());
  }

  #[tokio::test]
  async fn test_restore_after_failed_install_reinstalls() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.open("v1").unwrap();
    let fetcher = shell_fetcher();

    let agent = Agent::new(
      config("v2", &["/index.html", "/missing.png"]),
      storage.clone(),
      fetcher.clone(),
    );
    assert!(agent.install().await.is_err());
    assert_eq!(agent.phase(), Phase::Redundant);
    assert_eq!(storage.generations().unwrap(), vec!["v1"]);

    // A restarted host must install again rather than serve an empty generation
    let agent = Agent::new(
      config("v2", &["/index.html", "/missing.png"]),
      storage.clone(),
      fetcher,
    );
    assert!(agent.restore().await.unwrap().is_none());
    assert_eq!(agent.phase(), Phase::Installing);
    assert_eq!(storage.generations().unwrap(), vec!["v1"]);
  }
}
