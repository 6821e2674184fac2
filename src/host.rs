//! The surface the agent acts on: lifecycle signals, clients and notifications.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use url::Url;

use crate::agent::Notification;

/// Host-side effects available to the agent.
#[async_trait]
pub trait Host: Send + Sync {
  /// Let the installed version activate without waiting for old clients to close.
  async fn skip_waiting(&self) -> Result<()>;

  /// Route every open client through the active version.
  async fn claim_clients(&self) -> Result<()>;

  async fn show_notification(&self, notification: &Notification) -> Result<()>;

  fn close_notification(&self, notification: &Notification);

  /// Open (or focus) a client window on the given page.
  async fn open_window(&self, url: &Url) -> Result<()>;
}

/// Everything the local host has been asked to do
#[derive(Debug, Clone, Default)]
pub struct HostState {
  pub skip_waiting: bool,
  pub clients_claimed: bool,
  /// Notifications currently on display
  pub notifications: Vec<Notification>,
  /// Notifications that were closed
  pub closed: Vec<Notification>,
  pub windows: Vec<Url>,
}

/// In-process host that records requested effects and logs them.
#[derive(Debug, Default)]
pub struct LocalHost {
  state: Mutex<HostState>,
}

impl LocalHost {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self) -> HostState {
    match self.state.lock() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.snapshot().skip_waiting
  }

  fn lock(&self) -> Result<MutexGuard<'_, HostState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl Host for LocalHost {
  async fn skip_waiting(&self) -> Result<()> {
    info!("Skip waiting requested");
    self.lock()?.skip_waiting = true;
    Ok(())
  }

  async fn claim_clients(&self) -> Result<()> {
    info!("Claiming clients");
    self.lock()?.clients_claimed = true;
    Ok(())
  }

  async fn show_notification(&self, notification: &Notification) -> Result<()> {
    info!(title = %notification.title, body = %notification.body, "Showing notification");
    self.lock()?.notifications.push(notification.clone());
    Ok(())
  }

  fn close_notification(&self, notification: &Notification) {
    let Ok(mut state) = self.state.lock() else {
      return;
    };
    if let Some(pos) = state.notifications.iter().position(|n| n == notification) {
      state.notifications.remove(pos);
    }
    state.closed.push(notification.clone());
  }

  async fn open_window(&self, url: &Url) -> Result<()> {
    info!(%url, "Opening window");
    self.lock()?.windows.push(url.clone());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::NotificationConfig;
  use chrono::Utc;

  #[tokio::test]
  async fn test_records_lifecycle_signals() {
    let host = LocalHost::new();
    assert!(!host.skip_waiting_requested());

    host.skip_waiting().await.unwrap();
    host.claim_clients().await.unwrap();

    let state = host.snapshot();
    assert!(state.skip_waiting);
    assert!(state.clients_claimed);
  }

  #[tokio::test]
  async fn test_close_removes_from_display() {
    let host = LocalHost::new();
    let n = Notification::for_push(&NotificationConfig::default(), None, Utc::now());

    host.show_notification(&n).await.unwrap();
    assert_eq!(host.snapshot().notifications.len(), 1);

    host.close_notification(&n);
    let state = host.snapshot();
    assert!(state.notifications.is_empty());
    assert_eq!(state.closed, vec![n]);
  }
}
