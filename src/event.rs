//! Wire events and stream entries.
//!
//! An outbox row carries an opaque `payload`. Once its `event_type` tag is
//! known the payload decodes into exactly one [`DispatchableEvent`] type.
//! [`StreamMessage`] is what the consumer sees after the publisher appended
//! the row to the stream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::User;

/// Stream that carries user lifecycle events.
pub const USER_EVENTS_STREAM: &str = "user:events";

/// Consumer group of the welcome-email worker.
pub const EMAIL_SERVICE_GROUP: &str = "email-service";

/// Stream entry field holding the event tag.
pub const FIELD_EVENT_TYPE: &str = "event_type";

/// Stream entry field holding the aggregate correlation id.
pub const FIELD_AGGREGATE_ID: &str = "aggregate_id";

/// Stream entry field holding the JSON-encoded event.
pub const FIELD_PAYLOAD: &str = "payload";

/// A typed event that can be stored in the outbox and dispatched by tag.
pub trait DispatchableEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Tag written to `event_type`.
    const EVENT_TYPE: &'static str;

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Actions recorded in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    #[serde(rename = "user_created")]
    UserCreated,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::UserCreated => "user_created",
        }
    }
}

/// Emitted once per successfully created user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreatedEvent {
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub action: EventAction,
}

impl UserCreatedEvent {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            action: EventAction::UserCreated,
        }
    }
}

impl DispatchableEvent for UserCreatedEvent {
    const EVENT_TYPE: &'static str = "user_created";
}

/// Aggregate correlation id for a user row.
pub fn user_aggregate_id(user_id: i64) -> String {
    format!("user_{}", user_id)
}

/// An entry read from a stream through a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Broker-assigned entry id (e.g., "1700000000000-0")
    pub id: String,

    /// Raw field values
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    /// Add a field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(|v| v.as_slice())
    }

    /// Field value as text, replacing invalid UTF-8.
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.field(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}
