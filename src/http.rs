//! Request and response types shared by the store, the network and the interceptor.

use reqwest::Method;
use std::fmt;

/// Identity of an intercepted request: the cache key and the fetch parameter.
///
/// Keys are compared exactly. A relative locator and the absolute URL it would
/// resolve to are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: String,
}

impl RequestDescriptor {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

impl fmt::Display for RequestDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response as seen by the page.
///
/// Not `Clone`: a response that is both returned and persisted has to be
/// copied explicitly with [`Response::duplicate`].
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      status_text: default_status_text(status),
      headers: Vec::new(),
      body,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
    self.status_text = status_text.into();
    self
  }

  /// Whether the status is in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..=299).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  /// Consume the response, yielding its body.
  pub fn into_body(self) -> Vec<u8> {
    self.body
  }

  /// Byte-for-byte copy of status, headers and body.
  pub fn duplicate(&self) -> Self {
    Self {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

fn default_status_text(status: u16) -> String {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or_default()
    .to_string()
}
