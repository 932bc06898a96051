//! Host-side event loop.
//!
//! Lifecycle and fetch events arrive on a channel and are dispatched to the
//! agent, each on its own task, the way a browser dispatches worker events.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::cache::{CacheStorage, GcReport, ResponseSource};
use crate::error::{AgentError, FetchError};
use crate::http::{RequestDescriptor, Response};
use crate::interceptor::Interception;
use crate::network::Fetcher;

/// Events delivered by the host
#[derive(Debug)]
pub enum HostEvent {
  /// First registration or update of the agent
  Install {
    done: oneshot::Sender<Result<usize, AgentError>>,
  },
  /// The agent was chosen to take over
  Activate {
    done: oneshot::Sender<Result<GcReport, AgentError>>,
  },
  /// An outbound request from a controlled page
  Fetch {
    request: RequestDescriptor,
    reply: oneshot::Sender<FetchOutcome>,
  },
}

/// What the page observes for one request.
#[derive(Debug)]
pub struct FetchOutcome {
  /// `None` unless the agent supplied the response
  pub source: Option<ResponseSource>,
  pub result: Result<Response, FetchError>,
}

/// Handle for delivering events to a running agent.
#[derive(Clone)]
pub struct Host {
  tx: mpsc::UnboundedSender<HostEvent>,
}

impl Host {
  /// Spawn the dispatch loop for `agent`. `network` performs the host's own
  /// handling of requests the agent declines.
  pub fn spawn<S, F>(agent: Arc<Agent<S, F>>, network: Arc<F>) -> Self
  where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let agent = Arc::clone(&agent);
        let network = Arc::clone(&network);
        tokio::spawn(async move { dispatch(agent, network, event).await });
      }
      debug!("host event channel closed");
    });

    Self { tx }
  }

  /// Deliver the install event and wait for it to settle.
  pub async fn install(&self) -> Result<usize, AgentError> {
    let (done, rx) = oneshot::channel();
    self.send(HostEvent::Install { done });
    rx.await.unwrap_or_else(|_| Err(AgentError::HostStopped("install")))
  }

  /// Deliver the activate event and wait for it to settle.
  pub async fn activate(&self) -> Result<GcReport, AgentError> {
    let (done, rx) = oneshot::channel();
    self.send(HostEvent::Activate { done });
    rx.await.unwrap_or_else(|_| Err(AgentError::HostStopped("activate")))
  }

  /// Deliver one request and wait for the page-visible outcome.
  pub async fn fetch(&self, request: RequestDescriptor) -> FetchOutcome {
    let url = request.url.clone();
    let (reply, rx) = oneshot::channel();
    self.send(HostEvent::Fetch { request, reply });
    rx.await.unwrap_or_else(|_| FetchOutcome {
      source: None,
      result: Err(FetchError::Unreachable {
        url,
        reason: "agent stopped before responding".to_string(),
      }),
    })
  }

  fn send(&self, event: HostEvent) {
    if self.tx.send(event).is_err() {
      warn!("host event loop is not running");
    }
  }
}

async fn dispatch<S, F>(agent: Arc<Agent<S, F>>, network: Arc<F>, event: HostEvent)
where
  S: CacheStorage,
  F: Fetcher,
{
  match event {
    HostEvent::Install { done } => {
      if done.send(agent.install().await).is_err() {
        debug!("host stopped waiting for install");
      }
    }
    HostEvent::Activate { done } => {
      if done.send(agent.activate().await).is_err() {
        debug!("host stopped waiting for activate");
      }
    }
    HostEvent::Fetch { request, reply } => {
      let outcome = match agent.handle_fetch(&request).await {
        Interception::Bypass => FetchOutcome {
          source: None,
          result: network.fetch(&request).await,
        },
        Interception::Responded { response, source } => FetchOutcome {
          source: Some(source),
          result: Ok(response),
        },
        Interception::Failed(e) => FetchOutcome {
          source: None,
          result: Err(e),
        },
      };
      if reply.send(outcome).is_err() {
        debug!(%request, "page stopped waiting for response");
      }
    }
  }
}
