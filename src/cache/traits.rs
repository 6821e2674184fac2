//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::net::Request;

/// Trait for values that identify a cache entry.
pub trait CacheKey {
  /// Stable, fixed-length key used for storage lookups
  fn cache_hash(&self) -> String;

  /// Human readable form for logs and listings
  fn description(&self) -> String;
}

impl CacheKey for Request {
  fn cache_hash(&self) -> String {
    // Fragments never reach the server, so they are not part of the identity
    let mut url = self.url.clone();
    url.set_fragment(None);
    let input = format!("{} {}", self.method, url);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
  }

  fn description(&self) -> String {
    format!("{} {}", self.method, self.url)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Stored entry for the request itself
  Cache,
  /// Network unavailable, serving the offline fallback entry
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    }
  }
}
