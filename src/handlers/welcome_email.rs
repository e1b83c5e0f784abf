//! Welcome email for newly created users.
//!
//! The [`WelcomeEmailHandler`] turns a `user_created` event into a
//! [`WelcomeEmail`] and hands it to a [`Mailer`]. It writes nothing to the
//! store, so a duplicate delivery only sends a second email.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{EventHandler, HandlerError};
use crate::event::UserCreatedEvent;

/// Simulated send latency of [`LogMailer`].
const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(100);

/// A rendered welcome email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WelcomeEmail {
    pub to: String,
    pub name: String,
    pub subject: String,
    pub body: String,
}

impl WelcomeEmail {
    pub fn for_event(event: &UserCreatedEvent) -> Self {
        Self {
            to: event.email.clone(),
            name: event.name.clone(),
            subject: "Welcome!".to_string(),
            body: format!("Hi {}, thanks for signing up.", event.name),
        }
    }
}

/// Delivers emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &WelcomeEmail) -> Result<(), HandlerError>;
}

/// A mailer that only logs, after a short simulated delay.
#[derive(Debug, Clone)]
pub struct LogMailer {
    delay: Duration,
}

impl LogMailer {
    pub fn new() -> Self {
        Self {
            delay: DEFAULT_SEND_DELAY,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for LogMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &WelcomeEmail) -> Result<(), HandlerError> {
        info!(to = %email.to, name = %email.name, "Sending welcome email");
        tokio::time::sleep(self.delay).await;
        info!(to = %email.to, "Welcome email sent");
        Ok(())
    }
}

/// Sends a welcome email for every `user_created` event.
#[derive(Clone)]
pub struct WelcomeEmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl WelcomeEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventHandler<UserCreatedEvent> for WelcomeEmailHandler {
    fn name(&self) -> &str {
        "welcome-email"
    }

    async fn handle(&self, event: UserCreatedEvent) -> Result<(), HandlerError> {
        info!(
            user_id = event.user_id,
            email = %event.email,
            mailer = %self.mailer.name(),
            "Processing user_created event"
        );
        self.mailer.send(&WelcomeEmail::for_event(&event)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventAction;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<WelcomeEmail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, email: &WelcomeEmail) -> Result<(), HandlerError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn event() -> UserCreatedEvent {
        UserCreatedEvent {
            user_id: 7,
            name: "Alice".to_string(),
            email: "a@x.com".to_string(),
            action: EventAction::UserCreated,
        }
    }

    #[test]
    fn test_email_content() {
        let email = WelcomeEmail::for_event(&event());
        assert_eq!(email.to, "a@x.com");
        assert_eq!(email.name, "Alice");
        assert!(email.body.contains("Alice"));
    }

    #[tokio::test]
    async fn test_handler_sends_through_mailer() {
        let mailer = Arc::new(RecordingMailer::default());
        let handler = WelcomeEmailHandler::new(mailer.clone());

        handler.handle(event()).await.unwrap();
        handler.handle(event()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_mailer_waits_for_delay() {
        let mailer = LogMailer::with_delay(Duration::from_millis(250));
        let start = tokio::time::Instant::now();

        mailer.send(&WelcomeEmail::for_event(&event())).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
