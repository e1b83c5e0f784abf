//! # Outbox Relay
//!
//! A transactional outbox: domain writes and the events describing them
//! are committed together, then relayed into a Redis stream and consumed
//! through a consumer group.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API -> UserService --(one transaction)--> users + outbox_events
//!                                                        |
//!                       OutboxPublisher (poll, append, mark published)
//!                                                        v
//!                                             Redis stream "user:events"
//!                                                        |
//!               StreamConsumer (group "email-service") -> Dispatcher -> handlers
//! ```
//!
//! Delivery is at-least-once end to end; handlers must be idempotent.
//!
//! ## Modules
//!
//! - [`store`]: transactions, the user repository and the outbox table
//! - [`broker`]: append-only stream with consumer groups
//! - [`publisher`]: relays outbox rows into the stream
//! - [`consumer`] / [`dispatch`] / [`handlers`]: reading and reacting to events
//! - [`api`]: the HTTP surface

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod event;
pub mod handlers;
pub mod logging;
pub mod model;
pub mod publisher;
pub mod service;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use config::AppConfig;
pub use consumer::{ConsumeError, ConsumerConfig, StreamConsumer};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use event::{DispatchableEvent, UserCreatedEvent, EMAIL_SERVICE_GROUP, USER_EVENTS_STREAM};
pub use publisher::{OutboxPublisher, PublisherConfig};
pub use service::{ServiceError, UserService};
pub use shutdown::ShutdownSignal;
