use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhub_common::{MessageType, WireMessage};

/// A message received on one subscribed topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEvent {
    pub destination: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn from_wire(destination: impl Into<String>, message: WireMessage) -> Self {
        Self {
            destination: destination.into(),
            message_type: message.message_type,
            payload: message.payload,
            timestamp: message.timestamp,
        }
    }

    /// Human-readable line for the event, when the payload carries one.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(|m| m.as_str())
    }
}

/// What `mark_as_read` does with the accumulated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Only the unread flag and counter reset.
    #[default]
    KeepEvents,
    /// The event list is emptied as well.
    ClearEvents,
}

/// Arrival-ordered feed with an unread flag.
#[derive(Debug, Default)]
pub struct ActivityFeed {
    events: VecDeque<ActivityEvent>,
    has_new_activity: bool,
    unread: usize,
    capacity: Option<usize>,
    policy: ReadPolicy,
}

impl ActivityFeed {
    /// `capacity` of `None` keeps every event; otherwise the oldest drop first.
    pub fn new(policy: ReadPolicy, capacity: Option<usize>) -> Self {
        Self {
            events: VecDeque::new(),
            has_new_activity: false,
            unread: 0,
            capacity: capacity.filter(|c| *c > 0),
            policy,
        }
    }

    /// Append an event. Returns `true` only when this event raised the
    /// new-activity flag.
    pub fn on_event(&mut self, event: ActivityEvent) -> bool {
        if let Some(capacity) = self.capacity {
            while self.events.len() >= capacity {
                self.events.pop_front();
            }
        }
        self.events.push_back(event);
        self.unread += 1;
        let rising = !self.has_new_activity;
        self.has_new_activity = true;
        rising
    }

    pub fn mark_as_read(&mut self) {
        self.has_new_activity = false;
        self.unread = 0;
        if self.policy == ReadPolicy::ClearEvents {
            self.events.clear();
        }
    }

    pub fn has_new_activity(&self) -> bool {
        self.has_new_activity
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> impl DoubleEndedIterator<Item = &ActivityEvent> {
        self.events.iter()
    }

    /// Up to `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ActivityEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }
}
