use serde::Deserialize;
use serde_json::Value;

/// Control messages a page can post to the agent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate the installed version now
  SkipWaiting,
}

impl ControlMessage {
  /// Recognize a posted value. Anything unrecognized yields `None`.
  pub fn parse(data: &Value) -> Option<Self> {
    Self::deserialize(data).ok()
  }
}
