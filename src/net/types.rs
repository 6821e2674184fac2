use reqwest::Method;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// An intercepted outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Add a request header
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

/// How the response relates to the origin the agent serves.
///
/// Only `Basic` (same-origin) responses are readable enough to be worth storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response
  Cors,
  /// Cross-origin response with an unreadable body
  Opaque,
  /// Synthesized network error
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }
}

impl fmt::Display for ResponseType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResponseType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "opaque" => Ok(Self::Opaque),
      "error" => Ok(Self::Error),
      other => Err(format!("unknown response type '{}'", other)),
    }
  }
}

/// A fully buffered response snapshot.
///
/// The body is owned, so a clone is an independent copy that can be stored
/// while the other goes back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub response_type: ResponseType,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  #[cfg(test)]
  pub fn new(status: u16, response_type: ResponseType, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      response_type,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Status in the 200-299 range
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether a network response may be persisted after being served.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
