use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type tag of a message body on the real-time stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ActivityUpdate,
    Notification,
    TeamUpdate,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActivityUpdate => "ACTIVITY_UPDATE",
            Self::Notification => "NOTIFICATION",
            Self::TeamUpdate => "TEAM_UPDATE",
            Self::Heartbeat => "HEARTBEAT",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of a `MESSAGE` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            message_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}
