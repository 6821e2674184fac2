//! The cache lifecycle agent.
//!
//! Reacts to lifecycle, network and notification events against one cache
//! bucket: precache on install, evict old versions on activate, serve requests
//! cache-first with an offline fallback.

mod message;
mod notification;

pub use message::ControlMessage;
pub use notification::{Notification, ACTION_EXPLORE};

use chrono::Utc;
use color_eyre::eyre::{eyre, Report};
use color_eyre::Result;
use futures::future::try_join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheBucket, CacheResult, CacheStorage};
use crate::config::{Config, NotificationConfig};
use crate::event::{Event, ExtendableEvent};
use crate::host::Host;
use crate::net::{Fetcher, Request, Response};

/// Resolved, per-deployment settings of the agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
  pub precache: Vec<Url>,
  pub offline_fallback: Url,
  pub root_page: Url,
  pub sync_tag: String,
  pub notifications: NotificationConfig,
}

impl AgentSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    let precache = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      precache,
      offline_fallback: config.resolve(&config.offline_fallback)?,
      root_page: config.resolve(&config.root_page)?,
      sync_tag: config.sync_tag.clone(),
      notifications: config.notifications.clone(),
    })
  }
}

/// Event handlers closing over one cache bucket.
///
/// Cloning is cheap; clones share the bucket, the host and the set of
/// background writes.
pub struct Agent<S: CacheStorage> {
  bucket: CacheBucket<S>,
  fetcher: Arc<dyn Fetcher>,
  host: Arc<dyn Host>,
  settings: Arc<AgentSettings>,
  /// Cache writes detached from the requests that produced them
  background: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage + 'static> Agent<S> {
  pub fn new(
    bucket: CacheBucket<S>,
    fetcher: Arc<dyn Fetcher>,
    host: Arc<dyn Host>,
    settings: AgentSettings,
  ) -> Self {
    Self {
      bucket,
      fetcher,
      host,
      settings: Arc::new(settings),
      background: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn bucket(&self) -> &CacheBucket<S> {
    &self.bucket
  }

  pub fn settings(&self) -> &AgentSettings {
    &self.settings
  }

  /// Register the work an event needs with the event itself.
  ///
  /// Events that need no work (unknown messages, foreign sync tags) register
  /// nothing.
  pub fn handle(&self, event: Event, ext: &mut ExtendableEvent) {
    match event {
      Event::Install => {
        let agent = self.clone();
        ext.wait_until(async move { agent.install().await });
      }
      Event::Activate => {
        let agent = self.clone();
        ext.wait_until(async move { agent.activate().await });
      }
      Event::Message(data) => match ControlMessage::parse(&data) {
        Some(ControlMessage::SkipWaiting) => {
          let host = Arc::clone(&self.host);
          ext.wait_until(async move { host.skip_waiting().await });
        }
        None => debug!(%data, "Ignoring unrecognized message"),
      },
      Event::Push { payload } => {
        info!("Push received");
        let agent = self.clone();
        ext.wait_until(async move { agent.show_push(payload.as_deref()).await });
      }
      Event::NotificationClick {
        notification,
        action,
      } => {
        info!(action = action.as_deref().unwrap_or(""), "Notification clicked");
        self.host.close_notification(&notification);

        if action.as_deref() == Some(ACTION_EXPLORE) {
          let host = Arc::clone(&self.host);
          let root = self.settings.root_page.clone();
          ext.wait_until(async move { host.open_window(&root).await });
        }
      }
      Event::Sync { tag } => {
        if tag == self.settings.sync_tag {
          info!(%tag, "Background sync");
          ext.wait_until(do_background_sync());
        } else {
          debug!(%tag, "Ignoring sync tag");
        }
      }
    }
  }

  /// Precache every asset into the bucket, all or nothing, then ask to skip waiting.
  pub async fn install(&self) -> Result<()> {
    let name = self.bucket.name();
    info!(bucket = name, "Installing");

    let existed = self.bucket.storage().has_bucket(name)?;
    self.bucket.open()?;

    info!(bucket = name, count = self.settings.precache.len(), "Caching files");
    let precached = try_join_all(
      self
        .settings
        .precache
        .iter()
        .map(|url| self.precache_one(Request::get(url.clone()))),
    )
    .await
    .and_then(|entries| self.bucket.put_all(&entries));

    if let Err(e) = precached {
      // A failed install must not leave a half-built version behind
      if !existed {
        self.bucket.storage().delete_bucket(name)?;
      }
      return Err(e.wrap_err(format!("Install of {} failed", name)));
    }

    info!(bucket = name, "Installed successfully");
    self.host.skip_waiting().await
  }

  async fn precache_one(&self, request: Request) -> Result<(Request, Response)> {
    let response = self.fetcher.fetch(&request).await?;
    if !response.ok() {
      return Err(eyre!(
        "Precache request for {} returned status {}",
        request.url,
        response.status
      ));
    }
    Ok((request, response))
  }

  /// Delete every bucket but the live one, then take over open clients.
  ///
  /// Fails without touching the store when the live bucket was never installed.
  pub async fn activate(&self) -> Result<()> {
    let name = self.bucket.name();
    info!(bucket = name, "Activating");

    if !self.bucket.storage().has_bucket(name)? {
      return Err(eyre!("Cache bucket {} is not installed", name));
    }

    for name in self.bucket.evict_others()? {
      info!(bucket = %name, "Deleted old cache");
    }

    info!(bucket = self.bucket.name(), "Activated successfully");
    self.host.claim_clients().await
  }

  /// Serve a request cache-first.
  ///
  /// Misses go to the network. A 200 same-origin response is stored in the
  /// background while the caller gets its own copy. A network failure is
  /// answered with the offline fallback document.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    if let Some(cached) = self.bucket.lookup(&request)? {
      debug!(url = %request.url, "Serving from cache");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    debug!(url = %request.url, "Fetching from network");
    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.persist_in_background(request, response.clone());
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed, trying cache");
        let fallback = Request::get(self.settings.offline_fallback.clone());
        match self.bucket.lookup(&fallback)? {
          Some(cached) => Ok(CacheResult::offline(cached.response, cached.cached_at)),
          None => Err(e.wrap_err(format!(
            "No offline fallback cached at {}",
            self.settings.offline_fallback
          ))),
        }
      }
    }
  }

  fn persist_in_background(&self, request: Request, response: Response) {
    let agent = self.clone();
    let mut pending = self.background_writes();
    // Reap finished writes so the set only holds in-flight ones
    while pending.try_join_next().is_some() {}

    pending.spawn(async move {
      match agent.bucket.put(&request, &response) {
        Ok(()) => debug!(url = %request.url, "Stored network response"),
        Err(e) => agent.on_unhandled_rejection(&e),
      }
    });
  }

  fn background_writes(&self) -> MutexGuard<'_, JoinSet<()>> {
    match self.background.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Wait for every background write started so far.
  pub async fn settle_background(&self) {
    let mut pending = std::mem::take(&mut *self.background_writes());
    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "Background cache write did not complete");
      }
    }
  }

  async fn show_push(&self, payload: Option<&str>) -> Result<()> {
    let notification = Notification::for_push(&self.settings.notifications, payload, Utc::now());
    self.host.show_notification(&notification).await
  }

  /// Observer for handler failures
  pub fn on_error(&self, error: &Report) {
    error!(error = %format!("{:#}", error), "Error occurred");
  }

  /// Observer for failures of work nobody awaits
  pub fn on_unhandled_rejection(&self, reason: &Report) {
    error!(reason = %format!("{:#}", reason), "Unhandled rejection");
  }
}

/// Extension point for syncing queued data; currently completes immediately.
async fn do_background_sync() -> Result<()> {
  info!("Performing background sync");
  Ok(())
}

impl<S: CacheStorage> Clone for Agent<S> {
  fn clone(&self) -> Self {
    Self {
      bucket: self.bucket.clone(),
      fetcher: Arc::clone(&self.fetcher),
      host: Arc::clone(&self.host),
      settings: Arc::clone(&self.settings),
      background: Arc::clone(&self.background),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::notification::ACTION_CLOSE;
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::host::LocalHost;
  use crate::net::testing::FakeFetcher;
  use crate::net::ResponseType;
  use reqwest::Method;
  use serde_json::json;

  const ORIGIN: &str = "http://localhost:8080";

  struct Harness {
    agent: Agent<SqliteStorage>,
    fetcher: Arc<FakeFetcher>,
    host: Arc<LocalHost>,
    storage: Arc<SqliteStorage>,
  }

  impl Harness {
    fn new(cache_name: &str) -> Self {
      Self::with_storage(cache_name, Arc::new(SqliteStorage::open_in_memory().unwrap()))
    }

    fn with_storage(cache_name: &str, storage: Arc<SqliteStorage>) -> Self {
      let config = Config {
        cache_name: cache_name.to_string(),
        origin: ORIGIN.to_string(),
        ..Config::default()
      };
      let fetcher = Arc::new(FakeFetcher::new());
      let host = Arc::new(LocalHost::new());
      let agent = Agent::new(
        CacheBucket::new(Arc::clone(&storage), cache_name),
        fetcher.clone(),
        host.clone(),
        AgentSettings::from_config(&config).unwrap(),
      );
      Self {
        agent,
        fetcher,
        host,
        storage,
      }
    }

    fn serve_assets(&self) {
      for path in crate::config::URLS_TO_CACHE {
        self.fetcher.serve(path, &format!("asset {}", path));
      }
    }

    async fn run(&self, event: Event) -> Result<()> {
      let mut ext = ExtendableEvent::new();
      self.agent.handle(event, &mut ext);
      ext.settle().await
    }
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_install_precaches_every_asset() {
    let h = Harness::new("v1");
    h.serve_assets();

    h.run(Event::Install).await.unwrap();

    for path in crate::config::URLS_TO_CACHE {
      let entry = h.agent.bucket().get(&get(path)).unwrap();
      assert_eq!(
        entry.map(|e| e.response.body),
        Some(format!("asset {}", path).into_bytes()),
        "{}",
        path
      );
    }
    assert!(h.host.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let old = Harness::with_storage("v1", Arc::clone(&storage));
    old.serve_assets();
    old.run(Event::Install).await.unwrap();

    let new = Harness::with_storage("v2", Arc::clone(&storage));
    new.serve_assets();
    new.fetcher.fail("/icon-512.png");

    assert!(new.run(Event::Install).await.is_err());
    assert!(!new.host.skip_waiting_requested());
    assert_eq!(storage.bucket_names().unwrap(), vec!["v1"]);
    assert_eq!(old.agent.bucket().entries().unwrap().len(), 5);
  }

  #[tokio::test]
  async fn test_install_fails_on_error_status() {
    let h = Harness::new("v1");
    h.serve_assets();
    h.fetcher
      .serve_response("/manifest.json", Response::new(500, ResponseType::Basic, ""));

    assert!(h.agent.install().await.is_err());
    assert!(h.storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_evicts_other_versions_and_claims() {
    let h = Harness::new("v3");
    for old in ["v1", "v2", "unrelated"] {
      h.storage.open_bucket(old).unwrap();
    }
    h.agent.bucket().open().unwrap();

    h.run(Event::Activate).await.unwrap();

    assert_eq!(h.storage.bucket_names().unwrap(), vec!["v3"]);
    assert!(h.host.snapshot().clients_claimed);
  }

  #[tokio::test]
  async fn test_activate_without_install_keeps_live_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let old = Harness::with_storage("v1", Arc::clone(&storage));
    old.serve_assets();
    old.run(Event::Install).await.unwrap();

    let new = Harness::with_storage("v2", Arc::clone(&storage));
    new.serve_assets();
    new.fetcher.fail("/icon-512.png");
    assert!(new.run(Event::Install).await.is_err());

    let err = new.run(Event::Activate).await.unwrap_err();
    assert!(err.to_string().contains("not installed"));
    assert_eq!(storage.bucket_names().unwrap(), vec!["v1"]);
    assert!(!new.host.snapshot().clients_claimed);

    // The old version still answers offline
    new.fetcher.set_offline(true);
    let result = new.agent.fetch(get("/api/data")).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"asset /index.html");
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let h = Harness::new("v1");
    h.serve_assets();
    h.agent.install().await.unwrap();
    let calls = h.fetcher.calls();
    h.fetcher.serve("/index.html", "changed on server");

    let result = h.agent.fetch(get("/index.html")).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"asset /index.html");
    assert_eq!(h.fetcher.calls(), calls);
  }

  #[tokio::test]
  async fn test_miss_serves_network_and_stores_copy() {
    let h = Harness::new("v1");
    h.agent.bucket().open().unwrap();
    h.fetcher.serve("/styles.css", "body { color: red }");

    let result = h.agent.fetch(get("/styles.css")).await.unwrap();
    h.agent.settle_background().await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"body { color: red }");
    let stored = h.agent.bucket().get(&get("/styles.css")).unwrap().unwrap();
    assert_eq!(stored.response, result.data);

    // Second request is a hit
    let again = h.agent.fetch(get("/styles.css")).await.unwrap();
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(h.fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_non_cacheable_responses_are_passed_through() {
    let h = Harness::new("v1");
    h.agent.bucket().open().unwrap();
    h.fetcher
      .serve_response("/created", Response::new(201, ResponseType::Basic, "made"));
    h.fetcher
      .serve_response("/cdn.js", Response::new(200, ResponseType::Cors, "lib"));

    let missing = h.agent.fetch(get("/missing")).await.unwrap();
    let created = h.agent.fetch(get("/created")).await.unwrap();
    let cors = h.agent.fetch(get("/cdn.js")).await.unwrap();
    h.agent.settle_background().await;

    assert_eq!(missing.data.status, 404);
    assert_eq!(created.data.body, b"made");
    assert_eq!(cors.data.body, b"lib");
    assert!(h.agent.bucket().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_post_is_served_but_not_stored() {
    let h = Harness::new("v1");
    h.agent.bucket().open().unwrap();
    h.fetcher.serve("/api/data", "saved");
    let url = Url::parse(ORIGIN).unwrap().join("/api/data").unwrap();

    let result = h.agent.fetch(Request::new(Method::POST, url)).await.unwrap();
    h.agent.settle_background().await;

    assert_eq!(result.data.body, b"saved");
    assert!(h.agent.bucket().entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_falls_back_to_root_document() {
    let h = Harness::new("v1");
    h.serve_assets();
    h.agent.install().await.unwrap();
    h.fetcher.set_offline(true);

    let result = h.agent.fetch(get("/api/data")).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"asset /index.html");

    // Coarse fallback: an image gets the document too
    let image = h.agent.fetch(get("/photo.png")).await.unwrap();
    assert_eq!(image.data.body, b"asset /index.html");
  }

  #[tokio::test]
  async fn test_offline_without_fallback_is_error() {
    let h = Harness::new("v1");
    h.fetcher.set_offline(true);

    assert!(h.agent.fetch(get("/api/data")).await.is_err());
  }

  #[tokio::test]
  async fn test_write_failure_is_swallowed() {
    let h = Harness::new("v1");
    // Bucket never opened, so the background write has nowhere to go
    h.fetcher.serve("/late.js", "late");

    let result = h.agent.fetch(get("/late.js")).await.unwrap();
    h.agent.settle_background().await;

    assert_eq!(result.data.body, b"late");
    assert!(h.storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let h = Harness::new("v1");

    h.run(Event::Message(json!({ "type": "OTHER" })))
      .await
      .unwrap();
    assert!(!h.host.skip_waiting_requested());

    h.run(Event::Message(json!({ "type": "SKIP_WAITING" })))
      .await
      .unwrap();
    assert!(h.host.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_ignored_events_register_no_work() {
    let h = Harness::new("v1");
    let mut ext = ExtendableEvent::new();

    h.agent.handle(Event::Message(json!({ "type": "OTHER" })), &mut ext);
    h.agent.handle(
      Event::Sync {
        tag: "something-else".to_string(),
      },
      &mut ext,
    );

    assert_eq!(ext.pending(), 0);
  }

  #[tokio::test]
  async fn test_push_body_from_payload_or_default() {
    let h = Harness::new("v1");

    h.run(Event::Push { payload: None }).await.unwrap();
    h.run(Event::Push {
      payload: Some("X".to_string()),
    })
    .await
    .unwrap();

    let shown = h.host.snapshot().notifications;
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].body, "Ai exerciții noi de rezolvat!");
    assert_eq!(shown[1].body, "X");
  }

  #[tokio::test]
  async fn test_explore_click_opens_root_page() {
    let h = Harness::new("v1");
    let n = Notification::for_push(&h.agent.settings().notifications, None, Utc::now());
    h.host.show_notification(&n).await.unwrap();

    h.run(Event::NotificationClick {
      notification: n.clone(),
      action: Some(ACTION_EXPLORE.to_string()),
    })
    .await
    .unwrap();

    let state = h.host.snapshot();
    assert!(state.notifications.is_empty());
    assert_eq!(state.windows, vec![Url::parse("http://localhost:8080/").unwrap()]);
  }

  #[tokio::test]
  async fn test_other_clicks_only_close() {
    let h = Harness::new("v1");
    let n = Notification::for_push(&h.agent.settings().notifications, None, Utc::now());

    for action in [Some(ACTION_CLOSE.to_string()), None] {
      h.run(Event::NotificationClick {
        notification: n.clone(),
        action,
      })
      .await
      .unwrap();
    }

    let state = h.host.snapshot();
    assert_eq!(state.closed.len(), 2);
    assert!(state.windows.is_empty());
  }

  #[tokio::test]
  async fn test_background_sync_stub_resolves() {
    let h = Harness::new("v1");
    let mut ext = ExtendableEvent::new();
    h.agent.handle(
      Event::Sync {
        tag: "background-sync".to_string(),
      },
      &mut ext,
    );

    assert_eq!(ext.pending(), 1);
    assert!(ext.settle().await.is_ok());
  }
}
