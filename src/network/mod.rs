//! Network access for the agent.
//!
//! The agent never talks to the network directly; it goes through a
//! [`Fetcher`], so the host's networking stack can be swapped for a stub.

pub mod client;

use std::future::Future;

use crate::error::FetchError;
use crate::http::{RequestDescriptor, Response};

pub use client::HttpFetcher;

/// Issues network requests on behalf of the agent.
///
/// A fetch only fails for transport-level problems. Any HTTP status,
/// including 4xx and 5xx, is a successful fetch.
pub trait Fetcher: Send + Sync {
  fn fetch(
    &self,
    request: &RequestDescriptor,
  ) -> impl Future<Output = Result<Response, FetchError>> + Send;
}
