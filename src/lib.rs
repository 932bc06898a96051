//! Offline app-shell caching agent.
//!
//! Pre-caches a fixed manifest into a versioned cache generation, deletes
//! superseded generations on activation, and answers every request
//! cache-first with network fallback and write-back.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod interceptor;
pub mod network;

pub use agent::{Agent, Phase};
pub use config::{AgentConfig, Config};
pub use error::{AgentError, FetchError};
pub use http::{RequestDescriptor, Response};
pub use interceptor::{Interception, Interceptor};
