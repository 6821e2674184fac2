//! Worker lifecycle: the order in which install and activate are delivered.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStorage;
use crate::event::{Dispatcher, Event};
use crate::host::LocalHost;

/// Lifecycle state of one agent version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, nothing delivered yet
  Parsed,
  Installing,
  /// Installed and waiting for the previous version to let go
  Installed,
  Activating,
  /// Live: serving requests and owning clients
  Activated,
  /// Failed or replaced; never comes back
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  /// Allowed forward transitions. There is no way back.
  pub fn can_become(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Installed, Redundant)
        | (Activating, Activated)
        | (Activating, Redundant)
        | (Activated, Redundant)
    )
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Drives one agent version through install and activate.
pub struct Registration<S: CacheStorage> {
  dispatcher: Dispatcher<S>,
  host: Arc<LocalHost>,
  state: WorkerState,
}

impl<S: CacheStorage + 'static> Registration<S> {
  pub fn new(dispatcher: Dispatcher<S>, host: Arc<LocalHost>) -> Self {
    Self {
      dispatcher,
      host,
      state: WorkerState::Parsed,
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  fn transition(&mut self, next: WorkerState) -> Result<()> {
    if !self.state.can_become(next) {
      return Err(eyre!("Invalid worker transition {} -> {}", self.state, next));
    }
    info!(from = %self.state, to = %next, "Worker state changed");
    self.state = next;
    Ok(())
  }

  /// Install, then activate unless an older version still holds clients and
  /// skip-waiting was not requested.
  pub async fn start(&mut self) -> Result<WorkerState> {
    let bucket = self.dispatcher.agent().bucket();
    let has_predecessor = bucket
      .storage()
      .bucket_names()?
      .iter()
      .any(|name| name != bucket.name());

    self.transition(WorkerState::Installing)?;
    if let Err(e) = self.dispatcher.run(Event::Install).await {
      self.transition(WorkerState::Redundant)?;
      return Err(e);
    }
    self.transition(WorkerState::Installed)?;

    if has_predecessor && !self.host.skip_waiting_requested() {
      info!("Waiting for the previous version to release its clients");
      return Ok(self.state);
    }

    self.activate().await
  }

  /// Activate an installed version.
  pub async fn activate(&mut self) -> Result<WorkerState> {
    self.transition(WorkerState::Activating)?;
    if let Err(e) = self.dispatcher.run(Event::Activate).await {
      self.transition(WorkerState::Redundant)?;
      return Err(e);
    }
    self.transition(WorkerState::Activated)?;
    Ok(self.state)
  }

  /// Deliver a page message; a waiting version activates once skip-waiting is requested.
  pub async fn post_message(&mut self, data: Value) -> Result<WorkerState> {
    self.dispatcher.run(Event::Message(data)).await?;

    if self.state == WorkerState::Installed && self.host.skip_waiting_requested() {
      return self.activate().await;
    }
    Ok(self.state)
  }
}
