//! Event handlers.
//!
//! A handler reacts to one decoded event type. Handlers run after the
//! publisher's at-least-once relay, so each must tolerate seeing the same
//! event more than once.
//!
//! ```rust,ignore
//! use outbox_relay::handlers::{EventHandler, HandlerError};
//! use async_trait::async_trait;
//!
//! struct AuditHandler;
//!
//! #[async_trait]
//! impl EventHandler<UserCreatedEvent> for AuditHandler {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn handle(&self, event: UserCreatedEvent) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//! ```

pub mod webhook;
pub mod welcome_email;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::DispatchableEvent;

pub use webhook::WebhookMailer;
pub use welcome_email::{LogMailer, Mailer, WelcomeEmail, WelcomeEmailHandler};

/// Errors that can occur while handling an event.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic handler failure
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Reacts to events of type `E`.
#[async_trait]
pub trait EventHandler<E: DispatchableEvent>: Send + Sync {
    /// Short name used in logs (e.g. "welcome-email").
    fn name(&self) -> &str;

    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}
