use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use crate::agent::{Agent, Notification};
use crate::cache::{CacheResult, CacheStorage};
use crate::net::{Request, Response};

/// Events delivered to the agent
#[derive(Debug, Clone)]
pub enum Event {
  /// A new version should populate its bucket
  Install,
  /// The installed version takes over
  Activate,
  /// A page posted a message
  Message(Value),
  /// A push arrived, with its text payload if it had one
  Push { payload: Option<String> },
  /// The user clicked a notification or one of its actions
  NotificationClick {
    notification: Notification,
    action: Option<String>,
  },
  /// The host fired a background sync
  Sync { tag: String },
}

impl Event {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Message(_) => "message",
      Self::Push { .. } => "push",
      Self::NotificationClick { .. } => "notificationclick",
      Self::Sync { .. } => "sync",
    }
  }
}

/// An event that stays open until all work registered on it has settled.
///
/// Handlers must hand every piece of asynchronous work to `wait_until`;
/// anything not registered may be dropped when the event is torn down.
pub struct ExtendableEvent {
  pending: JoinSet<Result<()>>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    Self {
      pending: JoinSet::new(),
    }
  }

  /// Keep the event alive until `work` completes.
  pub fn wait_until<F>(&mut self, work: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.pending.spawn(work);
  }

  /// Number of registered pieces of work that have not been settled
  pub fn pending(&self) -> usize {
    self.pending.len()
  }

  /// Wait for all registered work. Fails if any of it failed, after all of it finished.
  pub async fn settle(mut self) -> Result<()> {
    let mut first_error = None;

    while let Some(joined) = self.pending.join_next().await {
      let outcome = joined
        .map_err(|e| eyre!("Event work did not complete: {}", e))
        .and_then(|result| result);
      if let Err(e) = outcome {
        first_error.get_or_insert(e);
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl Default for ExtendableEvent {
  fn default() -> Self {
    Self::new()
  }
}

/// Runs each event in its own task against a shared agent.
pub struct Dispatcher<S: CacheStorage> {
  agent: Agent<S>,
}

impl<S: CacheStorage + 'static> Dispatcher<S> {
  pub fn new(agent: Agent<S>) -> Self {
    Self { agent }
  }

  pub fn agent(&self) -> &Agent<S> {
    &self.agent
  }

  /// Spawn a task for the event.
  ///
  /// The task finishes once the handler and everything it registered have
  /// settled. Failures are reported to the agent's error observer and returned.
  pub fn dispatch(&self, event: Event) -> JoinHandle<Result<()>> {
    let agent = self.agent.clone();

    tokio::spawn(async move {
      let name = event.name();
      let mut ext = ExtendableEvent::new();
      agent.handle(event, &mut ext);
      debug!(event = name, pending = ext.pending(), "Event dispatched");

      let result = ext.settle().await;
      if let Err(e) = &result {
        agent.on_error(e);
      }
      result
    })
  }

  /// Dispatch and wait for the event to settle.
  pub async fn run(&self, event: Event) -> Result<()> {
    self
      .dispatch(event)
      .await
      .map_err(|e| eyre!("Event task did not complete: {}", e))?
  }

  /// Spawn a task answering an intercepted request.
  ///
  /// A request that cannot be answered is reported to the error observer and
  /// fails on its own; other requests in flight are unaffected.
  pub fn dispatch_fetch(&self, request: Request) -> JoinHandle<Result<CacheResult<Response>>> {
    let agent = self.agent.clone();
    tokio::spawn(async move {
      let result = agent.fetch(request).await;
      if let Err(e) = &result {
        agent.on_error(e);
      }
      result
    })
  }

  /// Wait for detached work (background cache writes) before the process exits.
  pub async fn shutdown(&self) {
    self.agent.settle_background().await;
  }
}
