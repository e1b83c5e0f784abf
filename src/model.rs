//! Domain and outbox records.
//!
//! [`User`] is the primary entity. [`PendingEvent`] is an outbox row: it is
//! written in the same transaction as the user it describes and later
//! relayed to the event stream by the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::ServiceError;

/// A persisted user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a user.
///
/// Missing JSON fields decode to empty strings so that they are reported by
/// [`CreateUserParams::validate`] rather than as a malformed body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl CreateUserParams {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Reject empty names and emails. Values are taken as given, so
    /// whitespace counts as present.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.name.is_empty() {
            return Err(ServiceError::Validation("name is required".to_string()));
        }

        if self.email.is_empty() {
            return Err(ServiceError::Validation("email is required".to_string()));
        }

        Ok(())
    }
}

/// An outbox row.
///
/// `id` is assigned by the store and is strictly increasing, so it doubles
/// as the publish order. `aggregate_id` is opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl PendingEvent {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Fields supplied by the caller when inserting an outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl NewPendingEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}
