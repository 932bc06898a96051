use reqwest::header::HeaderMap;
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::Fetcher;
use crate::config::NetworkConfig;
use crate::error::FetchError;
use crate::http::{RequestDescriptor, Response};

const DEFAULT_USER_AGENT: &str = concat!("shellcache/", env!("CARGO_PKG_VERSION"));

/// Fetcher backed by reqwest
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  base_url: Url,
}

impl HttpFetcher {
  pub fn new(config: &NetworkConfig) -> Result<Self, FetchError> {
    let base_url = Url::parse(&config.base_url).map_err(|source| FetchError::InvalidUrl {
      url: config.base_url.clone(),
      source,
    })?;

    let client = Client::builder()
      .timeout(config.timeout())
      .user_agent(
        config
          .user_agent
          .clone()
          .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
      )
      .build()
      .map_err(|source| FetchError::Network {
        url: config.base_url.clone(),
        source,
      })?;

    Ok(Self { client, base_url })
  }

  /// Resolve a locator against the base URL. Absolute URLs pass through.
  pub fn resolve(&self, locator: &str) -> Result<Url, FetchError> {
    match Url::parse(locator) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => {
        self
          .base_url
          .join(locator)
          .map_err(|source| FetchError::InvalidUrl {
            url: locator.to_string(),
            source,
          })
      }
      Err(source) => Err(FetchError::InvalidUrl {
        url: locator.to_string(),
        source,
      }),
    }
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &RequestDescriptor) -> Result<Response, FetchError> {
    let url = self.resolve(&request.url)?;
    let network_error = |source| FetchError::Network {
      url: url.to_string(),
      source,
    };

    debug!(method = %request.method, %url, "network fetch");
    let resp = self
      .client
      .request(request.method.clone(), url.clone())
      .send()
      .await
      .map_err(network_error)?;

    let status = resp.status();
    let headers = header_pairs(resp.headers());

    let body = resp.bytes().await.map_err(network_error)?;

    let mut response = Response::new(status.as_u16(), body.to_vec())
      .with_status_text(status.canonical_reason().unwrap_or_default());
    response.headers = headers;
    Ok(response)
  }
}

/// Flatten response headers, keeping values that are not valid UTF-8.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;
  use reqwest::Method;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn fetcher_for(base_url: &str) -> HttpFetcher {
    HttpFetcher::new(&NetworkConfig {
      base_url: base_url.to_string(),
      timeout_secs: 5,
      user_agent: None,
    })
    .unwrap()
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let fetcher = fetcher_for("https://app.example.com/alexiaflix/");

    assert_eq!(
      fetcher.resolve(".").unwrap().as_str(),
      "https://app.example.com/alexiaflix/"
    );
    assert_eq!(
      fetcher.resolve("index.html").unwrap().as_str(),
      "https://app.example.com/alexiaflix/index.html"
    );
    assert_eq!(
      fetcher.resolve("/data.json").unwrap().as_str(),
      "https://app.example.com/data.json"
    );
    assert_eq!(
      fetcher.resolve("https://cdn.tailwindcss.com").unwrap().as_str(),
      "https://cdn.tailwindcss.com/"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let result = HttpFetcher::new(&NetworkConfig {
      base_url: "::".to_string(),
      ..NetworkConfig::default()
    });
    assert!(matches!(result, Err(FetchError::InvalidUrl { .. })));
  }

  #[tokio::test]
  async fn test_fetch_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
      .and(path("/data.json"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_raw("{\"a\":1}", "application/json"),
      )
      .mount(&mock_server)
      .await;

    let fetcher = fetcher_for(&format!("{}/", mock_server.uri()));
    let response = fetcher
      .fetch(&RequestDescriptor::get("/data.json"))
      .await
      .expect("fetch failed");

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.into_body(), b"{\"a\":1}".to_vec());
  }

  #[test]
  fn test_header_pairs_keep_opaque_values() {
    let mut headers = HeaderMap::new();
    headers.insert("etag", HeaderValue::from_static("\"v2\""));
    headers.insert("x-title", HeaderValue::from_bytes(b"caf\xe9").unwrap());

    let pairs = header_pairs(&headers);

    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&("etag".to_string(), "\"v2\"".to_string())));
    assert!(pairs.contains(&("x-title".to_string(), "caf\u{fffd}".to_string())));
  }

  #[tokio::test]
  async fn test_error_status_is_not_a_fetch_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
      .and(path("/missing"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&mock_server)
      .await;

    let fetcher = fetcher_for(&format!("{}/", mock_server.uri()));
    let response = fetcher
      .fetch(&RequestDescriptor::new(Method::POST, "missing"))
      .await
      .expect("fetch failed");

    assert_eq!(response.status, 404);
    assert!(!response.ok());
  }

  #[tokio::test]
  async fn test_connection_refused_is_network_error() {
    // Bind then drop a listener to get a port nobody is serving
    let port = {
      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };

    let fetcher = fetcher_for(&format!("http://127.0.0.1:{}/", port));
    let err = fetcher
      .fetch(&RequestDescriptor::get("index.html"))
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Network { .. }));
  }
}
