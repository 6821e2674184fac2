//! Push notification descriptors.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::NotificationConfig;

/// Action id that opens the root page
pub const ACTION_EXPLORE: &str = "explore";
/// Action id that only dismisses
pub const ACTION_CLOSE: &str = "close";

/// A notification as handed to the host's notification surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
  pub date_of_arrival: DateTime<Utc>,
  pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

impl Notification {
  /// Build the notification for a push.
  ///
  /// Only an absent payload falls back to the default body; an empty payload
  /// stays empty.
  pub fn for_push(config: &NotificationConfig, payload: Option<&str>, now: DateTime<Utc>) -> Self {
    let body = payload.map_or_else(|| config.default_body.clone(), str::to_string);

    Self {
      title: config.title.clone(),
      body,
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: now,
        primary_key: 1,
      },
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: config.explore_title.clone(),
          icon: config.icon.clone(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: config.close_title.clone(),
          icon: config.icon.clone(),
        },
      ],
    }
  }
}
