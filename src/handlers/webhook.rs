//! Webhook mailer - HTTP POST to an external mail service.
//!
//! ```rust,ignore
//! use outbox_relay::handlers::WebhookMailer;
//! use std::time::Duration;
//!
//! let mailer = WebhookMailer::new("https://mail.internal/send")
//!     .with_timeout(Duration::from_secs(5))
//!     .with_retries(2);
//! ```

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::welcome_email::{Mailer, WelcomeEmail};
use super::HandlerError;

const MAIL_TIMEOUT: Duration = Duration::from_secs(10);
const MAIL_RETRIES: u32 = 1;

/// A [`Mailer`] that POSTs `{to, name, subject, body}` JSON to a URL.
///
/// Server errors and transport failures are retried; client errors are not.
#[derive(Debug, Clone)]
pub struct WebhookMailer {
    url: String,
    client: Client,

    /// Per-attempt request timeout
    timeout: Duration,

    /// Extra attempts after a server error or transport failure
    retries: u32,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: MAIL_TIMEOUT,
            retries: MAIL_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `email`, retrying server errors and transport failures.
    ///
    /// Returns the final status, which may be a client error.
    async fn send_request(&self, email: &WelcomeEmail) -> Result<reqwest::StatusCode, HandlerError> {
        let mut failure = HandlerError::Failed("mail webhook was never called".into());

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!(attempt, retries = self.retries, "Retrying mail webhook");
            }

            failure = match self.post_once(email).await {
                Ok(status) if !status.is_server_error() => return Ok(status),
                Ok(status) => {
                    warn!(%status, attempt, "Mail service answered with a server error");
                    HandlerError::Failed(format!("server error: {}", status))
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Could not reach mail service");
                    HandlerError::Http(e)
                }
            };
        }

        Err(failure)
    }

    async fn post_once(&self, email: &WelcomeEmail) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(email)
            .send()
            .await?;
        Ok(response.status())
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    fn name(&self) -> &str {
        "mail-webhook"
    }

    async fn send(&self, email: &WelcomeEmail) -> Result<(), HandlerError> {
        match self.send_request(email).await? {
            status if status.is_success() => {
                info!(url = %self.url, %status, to = %email.to, "Welcome email delivered");
                Ok(())
            }
            status => {
                error!(url = %self.url, %status, to = %email.to, "Mail service rejected email");
                Err(HandlerError::Failed(format!("mail service returned {}", status)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn email() -> WelcomeEmail {
        WelcomeEmail {
            to: "a@x.com".to_string(),
            name: "Alice".to_string(),
            subject: "Welcome!".to_string(),
            body: "Hi Alice".to_string(),
        }
    }

    /// Serve `status` for every request and count hits.
    async fn serve(status: StatusCode) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/send",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    assert_eq!(body["to"], "a@x.com");
                    counter.fetch_add(1, Ordering::SeqCst);
                    status
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/send", addr), hits)
    }

    #[test]
    fn test_defaults_and_overrides() {
        let mailer = WebhookMailer::new("https://example.com/send");
        assert_eq!(mailer.timeout, MAIL_TIMEOUT);
        assert_eq!(mailer.retries, MAIL_RETRIES);

        let tuned = mailer.with_timeout(Duration::from_secs(3)).with_retries(0);
        assert_eq!(tuned.url(), "https://example.com/send");
        assert_eq!(tuned.timeout, Duration::from_secs(3));
        assert_eq!(tuned.retries, 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WebhookMailer::new(format!("http://{}/send", addr))
            .with_retries(0)
            .send(&email())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Http(_)));
    }

    #[tokio::test]
    async fn test_delivers_on_success() {
        let (url, hits) = serve(StatusCode::OK).await;
        WebhookMailer::new(url).send(&email()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let (url, hits) = serve(StatusCode::BAD_GATEWAY).await;
        let err = WebhookMailer::new(url)
            .with_retries(2)
            .send(&email())
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Failed(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, hits) = serve(StatusCode::UNPROCESSABLE_ENTITY).await;
        let err = WebhookMailer::new(url)
            .with_retries(2)
            .send(&email())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("422"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
