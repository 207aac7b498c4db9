//! HTTP transport seam between the scheduler and the network.
//!
//! All provider calls are plain GETs with a fixed timeout and client
//! identifier. The trait exists so the scheduler state machine can be
//! driven in tests with a scripted transport instead of the network.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Per-call timeout for every provider request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fixed client identifier sent with every request.
pub const USER_AGENT: &str = concat!("gitpulse/", env!("CARGO_PKG_VERSION"));

/// A fully built provider request: origin, path+query and extra headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
  /// Scheme + authority, e.g. `https://api.github.com`
  pub origin: String,
  /// Path and query, e.g. `/repos/acme/widgets/commits/abc/check-runs?per_page=100`
  pub path: String,
  /// Additional headers (auth, accept)
  pub headers: Vec<(String, String)>,
}

impl ProviderRequest {
  pub fn url(&self) -> String {
    format!("{}{}", self.origin, self.path)
  }
}

/// A completed HTTP exchange. Any status code lands here; only transport
/// level failures (DNS, connect, timeout, broken stream) become errors.
#[derive(Debug)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl HttpResponse {
  /// Header value as a string, if present and valid UTF-8.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
  async fn get(&self, request: &ProviderRequest) -> Result<HttpResponse>;
}

/// Production transport backed by a shared reqwest client.
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn get(&self, request: &ProviderRequest) -> Result<HttpResponse> {
    let mut builder = self.client.get(request.url());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url(), e))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    // A stream error mid-body is still a transport error; the scheduler
    // must see exactly one outcome for the attempt either way.
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Response body from {} failed: {}", request.url(), e))?
      .to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scripted transport for driving the scheduler in tests.

  use super::*;
  use color_eyre::eyre::eyre;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::{Arc, Mutex};

  pub struct MockTransport {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
  }

  impl MockTransport {
    pub fn new(responses: Vec<Result<HttpResponse>>) -> Arc<Self> {
      Arc::new(Self {
        responses: Mutex::new(responses.into()),
        requests: Mutex::new(Vec::new()),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
      })
    }

    pub fn request_count(&self) -> usize {
      self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
      self.requests.lock().unwrap().clone()
    }

    pub fn push_response(&self, response: Result<HttpResponse>) {
      self.responses.lock().unwrap().push_back(response);
    }
  }

  #[async_trait]
  impl HttpTransport for MockTransport {
    async fn get(&self, request: &ProviderRequest) -> Result<HttpResponse> {
      let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(current, Ordering::SeqCst);
      self.requests.lock().unwrap().push(request.clone());

      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      let response = self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(eyre!("no scripted response left")));

      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      response
    }
  }

  /// Build a canned response with the given status, headers and body.
  pub fn response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
      map.insert(
        reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
        value.parse().unwrap(),
      );
    }
    Ok(HttpResponse {
      status,
      headers: map,
      body: body.to_vec(),
    })
  }
}
