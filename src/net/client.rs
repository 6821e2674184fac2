use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use super::types::{Request, Response, ResponseType};

/// Abstraction over the network so the agent can be driven without one.
///
/// An `Err` means the request never produced a response (DNS, connection,
/// TLS, body read). HTTP error statuses are `Ok` responses.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network fetcher backed by reqwest
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status();
    let response_type = classify(&self.origin, response.url());
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      response_type,
      headers,
      body: body.to_vec(),
    })
  }
}

/// Same-origin responses are `basic`, everything else is `cors`.
///
/// Uses the final URL so a redirect off-origin is not mistaken for a local asset.
pub fn classify(origin: &Url, final_url: &Url) -> ResponseType {
  if origin.origin() == final_url.origin() {
    ResponseType::Basic
  } else {
    ResponseType::Cors
  }
}
