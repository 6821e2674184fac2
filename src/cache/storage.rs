//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::CacheKey;
use crate::net::{Request, Response};

/// A single stored request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Method of the request the entry was stored under
  pub method: String,
  /// URL of the request the entry was stored under
  pub url: String,
  /// The stored response snapshot
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named buckets. Bucket names are returned in
/// creation order, and lookups across buckets honour that order.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, name: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has_bucket(&self, name: &str) -> Result<bool>;

  /// All bucket names, oldest first.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything in it. Returns false if it did not exist.
  fn delete_bucket(&self, name: &str) -> Result<bool>;

  /// Look up an entry in one bucket.
  fn get_entry(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Look up an entry in any bucket, oldest bucket first.
  fn match_entry(&self, key: &str) -> Result<Option<CachedEntry>>;

  /// Store entries into an existing bucket, replacing entries with the same key.
  ///
  /// Either every entry is written or none is.
  fn store_entries(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Every entry of a bucket, ordered by URL.
  fn list_entries(&self, bucket: &str) -> Result<Vec<CachedEntry>>;

  /// Number of entries in a bucket, without loading them.
  fn count_entries(&self, bucket: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-agent").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named buckets; id order is creation order
CREATE TABLE IF NOT EXISTS cache_buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request hash
CREATE TABLE IF NOT EXISTS cache_entries (
    bucket_id INTEGER NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket_id, request_key),
    FOREIGN KEY (bucket_id) REFERENCES cache_buckets(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

const ENTRY_COLUMNS: &str =
  "e.method, e.url, e.status, e.status_text, e.response_type, e.headers, e.body, e.cached_at";

/// Row as read from SQLite, before decoding the text columns.
struct EntryRow {
  method: String,
  url: String,
  status: u16,
  status_text: String,
  response_type: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl EntryRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      method: row.get(0)?,
      url: row.get(1)?,
      status: row.get(2)?,
      status_text: row.get(3)?,
      response_type: row.get(4)?,
      headers: row.get(5)?,
      body: row.get(6)?,
      cached_at: row.get(7)?,
    })
  }

  fn decode(self) -> Result<CachedEntry> {
    let response_type = self
      .response_type
      .parse()
      .map_err(|e| eyre!("Corrupt cache entry for {}: {}", self.url, e))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", self.url, e))?;
    let cached_at = parse_datetime(&self.cached_at)?;

    Ok(CachedEntry {
      method: self.method,
      url: self.url,
      response: Response {
        status: self.status,
        status_text: self.status_text,
        response_type,
        headers,
        body: self.body,
      },
      cached_at,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_buckets (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open cache bucket {}: {}", name, e))?;

    Ok(())
  }

  fn has_bucket(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    let id: Option<i64> = conn
      .query_row(
        "SELECT id FROM cache_buckets WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", name, e))?;

    Ok(id.is_some())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_buckets ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries
       WHERE bucket_id IN (SELECT id FROM cache_buckets WHERE name = ?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_buckets WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache bucket {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get_entry(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let sql = format!(
      "SELECT {} FROM cache_entries e
       INNER JOIN cache_buckets b ON b.id = e.bucket_id
       WHERE b.name = ? AND e.request_key = ?",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![bucket, key], EntryRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(EntryRow::decode).transpose()
  }

  fn match_entry(&self, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let sql = format!(
      "SELECT {} FROM cache_entries e
       INNER JOIN cache_buckets b ON b.id = e.bucket_id
       WHERE e.request_key = ?
       ORDER BY b.id
       LIMIT 1",
      ENTRY_COLUMNS
    );

    let row = conn
      .query_row(&sql, params![key], EntryRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row.map(EntryRow::decode).transpose()
  }

  fn store_entries(&self, bucket: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let bucket_id: i64 = tx
      .query_row(
        "SELECT id FROM cache_buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", bucket, e))?
      .ok_or_else(|| eyre!("Cache bucket {} does not exist", bucket))?;

    for (request, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (bucket_id, request_key, method, url, status, status_text, response_type, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          bucket_id,
          request.cache_hash(),
          request.method.as_str(),
          request.url.as_str(),
          response.status,
          response.status_text,
          response.response_type.as_str(),
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store entry for {}: {}", request.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn list_entries(&self, bucket: &str) -> Result<Vec<CachedEntry>> {
    let conn = self.lock()?;

    let sql = format!(
      "SELECT {} FROM cache_entries e
       INNER JOIN cache_buckets b ON b.id = e.bucket_id
       WHERE b.name = ?
       ORDER BY e.url",
      ENTRY_COLUMNS
    );

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], EntryRow::from_row)
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    rows.into_iter().map(EntryRow::decode).collect()
  }

  fn count_entries(&self, bucket: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries e
         INNER JOIN cache_buckets b ON b.id = e.bucket_id
         WHERE b.name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::ResponseType;
  use url::Url;

  fn request(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:8080").unwrap().join(path).unwrap())
  }

  fn response(body: &str) -> Response {
    Response::new(200, ResponseType::Basic, body)
  }

  #[test]
  fn test_buckets_listed_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v2").unwrap();
    storage.open_bucket("v1").unwrap();
    storage.open_bucket("v2").unwrap();

    assert_eq!(storage.bucket_names().unwrap(), vec!["v2", "v1"]);
    assert!(storage.has_bucket("v1").unwrap());
    assert!(!storage.has_bucket("v3").unwrap());
  }

  #[test]
  fn test_store_and_get_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();

    let mut resp = response("<html></html>");
    resp.status_text = "OK".to_string();
    resp
      .headers
      .push(("content-type".to_string(), "text/html".to_string()));
    let req = request("/index.html");
    storage
      .store_entries("v1", &[(req.clone(), resp.clone())])
      .unwrap();

    let entry = storage
      .get_entry("v1", &req.cache_hash())
      .unwrap()
      .expect("entry stored");
    assert_eq!(entry.response, resp);
    assert_eq!(entry.method, "GET");
    assert_eq!(entry.url, "http://localhost:8080/index.html");
    assert!(storage.get_entry("v2", &req.cache_hash()).unwrap().is_none());
  }

  #[test]
  fn test_store_overwrites_existing_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    let req = request("/styles.css");

    storage
      .store_entries("v1", &[(req.clone(), response("old"))])
      .unwrap();
    storage
      .store_entries("v1", &[(req.clone(), response("new"))])
      .unwrap();

    let entries = storage.list_entries("v1").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response.body, b"new");
  }

  #[test]
  fn test_store_into_missing_bucket_fails_and_writes_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let result = storage.store_entries("gone", &[(request("/a"), response("a"))]);

    assert!(result.is_err());
    assert!(storage.match_entry(&request("/a").cache_hash()).unwrap().is_none());
  }

  #[test]
  fn test_count_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    storage.open_bucket("v2").unwrap();
    storage
      .store_entries(
        "v1",
        &[(request("/a"), response("a")), (request("/b"), response("b"))],
      )
      .unwrap();

    assert_eq!(storage.count_entries("v1").unwrap(), 2);
    assert_eq!(storage.count_entries("v2").unwrap(), 0);
    assert_eq!(storage.count_entries("missing").unwrap(), 0);
  }

  #[test]
  fn test_match_prefers_oldest_bucket() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    storage.open_bucket("v2").unwrap();
    let req = request("/index.html");

    storage
      .store_entries("v2", &[(req.clone(), response("two"))])
      .unwrap();
    storage
      .store_entries("v1", &[(req.clone(), response("one"))])
      .unwrap();

    let entry = storage.match_entry(&req.cache_hash()).unwrap().unwrap();
    assert_eq!(entry.response.body, b"one");
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("v1").unwrap();
    let req = request("/index.html");
    storage
      .store_entries("v1", &[(req.clone(), response("x"))])
      .unwrap();

    assert!(storage.delete_bucket("v1").unwrap());
    assert!(!storage.delete_bucket("v1").unwrap());
    assert!(storage.bucket_names().unwrap().is_empty());
    assert!(storage.match_entry(&req.cache_hash()).unwrap().is_none());

    // A recreated bucket with the same name starts empty
    storage.open_bucket("v1").unwrap();
    assert!(storage.list_entries("v1").unwrap().is_empty());
  }

  #[test]
  fn test_entries_persist_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let req = request("/manifest.json");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.open_bucket("v1").unwrap();
      storage
        .store_entries("v1", &[(req.clone(), response("{}"))])
        .unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.bucket_names().unwrap(), vec!["v1"]);
    let entry = storage.get_entry("v1", &req.cache_hash()).unwrap().unwrap();
    assert_eq!(entry.response.body, b"{}");
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-03-01 12:30:45").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:45+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
