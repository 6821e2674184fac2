//! Handle to the live cache bucket.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::storage::{CacheStorage, CachedEntry};
use super::traits::CacheKey;
use crate::net::{Request, Response};

/// A named bucket inside a cache store.
///
/// Handlers receive this handle instead of reaching for a global cache. Writes
/// go to this bucket only; lookups search the whole store, so entries from a
/// version that has not been evicted yet still answer requests.
pub struct CacheBucket<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> CacheBucket<S> {
  pub fn new(storage: Arc<S>, name: impl Into<String>) -> Self {
    Self {
      storage,
      name: name.into(),
    }
  }

  /// Version string identifying this bucket
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Handle to another bucket in the same store.
  pub fn sibling(&self, name: impl Into<String>) -> Self {
    Self::new(Arc::clone(&self.storage), name)
  }

  /// Create the bucket if absent.
  pub fn open(&self) -> Result<()> {
    self.storage.open_bucket(&self.name)
  }

  /// Find a stored response for the request in any bucket.
  ///
  /// Only GET requests can ever match.
  pub fn lookup(&self, request: &Request) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }
    self.storage.match_entry(&request.cache_hash())
  }

  /// Find a stored response for the request in this bucket only.
  pub fn get(&self, request: &Request) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }
    self.storage.get_entry(&self.name, &request.cache_hash())
  }

  /// Store one response, replacing any previous entry for the request.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    ensure_storable(request)?;
    self
      .storage
      .store_entries(&self.name, &[(request.clone(), response.clone())])
  }

  /// Store every pair or none of them.
  pub fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
    for (request, _) in entries {
      ensure_storable(request)?;
    }
    self.storage.store_entries(&self.name, entries)
  }

  /// Delete every other bucket in the store. Returns the deleted names.
  pub fn evict_others(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.bucket_names()? {
      if name != self.name && self.storage.delete_bucket(&name)? {
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  pub fn entries(&self) -> Result<Vec<CachedEntry>> {
    self.storage.list_entries(&self.name)
  }
}

fn ensure_storable(request: &Request) -> Result<()> {
  if request.is_get() {
    Ok(())
  } else {
    Err(eyre!(
      "Request method {} is unsupported for caching ({})",
      request.method,
      request.url
    ))
  }
}

impl<S: CacheStorage> Clone for CacheBucket<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      name: self.name.clone(),
    }
  }
}
