//! Event values carried through channel layers

use serde::{Deserialize, Serialize};

/// A message delivered to a group.
///
/// Events are created by a channel layer when it receives a published item
/// and are handed to every local subscriber of `group`. Equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Group the message was published to
    pub group: String,

    /// Message payload
    pub message: serde_json::Value,
}

impl Event {
    /// Create a new event.
    pub fn new(group: impl Into<String>, message: impl Into<serde_json::Value>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
        }
    }

    /// Get the message as a string slice, if it is a JSON string.
    pub fn message_str(&self) -> Option<&str> {
        self.message.as_str()
    }

    /// Parse the message into a specific type.
    pub fn parse_message<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.message.clone())
    }
}

/// Item pushed into a subscriber's local queue.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Delivery {
    /// An event for the subscriber's group
    Event(Event),
    /// The subscription was released; nothing follows
    Closed,
}
