//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is shared by the HTTP server, the publisher and the
//! consumer. Once triggered (by SIGINT/SIGTERM or programmatically) every
//! clone observes it. Loops check it only between iterations, so in-flight
//! work always runs to completion.
//!
//! ```rust,ignore
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen_for_os_signals());
//!
//! let stats = shutdown.drain(publisher.run(shutdown.clone())).await;
//! ```

use std::future::IntoFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for draining work after shutdown begins.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable stop flag shared by every long-running component.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DRAIN_TIMEOUT)
    }

    /// Same as [`new`](Self::new) with a different drain grace period.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// Grace period the binaries allow for components to finish.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown programmatically. Idempotent.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// If a handler cannot be installed the failure is logged and that
    /// signal is simply never observed.
    pub async fn listen_for_os_signals(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let signal = tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = terminate => "SIGTERM",
            _ = self.token.cancelled() => return,
        };

        info!(signal, "Stopping after in-flight work completes");
        self.trigger();
    }

    /// Drive `work` to completion, but once shutdown has been triggered
    /// give it at most [`timeout`](Self::timeout) more.
    ///
    /// Returns `None` if the grace period ran out first; `work` is dropped.
    pub async fn drain<F>(&self, work: F) -> Option<F::Output>
    where
        F: IntoFuture,
    {
        let work = work.into_future();
        tokio::pin!(work);

        tokio::select! {
            biased;
            output = &mut work => return Some(output),
            _ = self.token.cancelled() => {}
        }

        match tokio::time::timeout(self.timeout(), work).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!(
                    grace_period_ms = self.timeout.as_millis() as u64,
                    "Gave up waiting for in-flight work"
                );
                None
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_timeout() {
        assert_eq!(ShutdownSignal::new().timeout(), DRAIN_TIMEOUT);
        assert_eq!(
            ShutdownSignal::with_timeout(Duration::from_secs(5)).timeout(),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_trigger_from_another_task() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_shutdown());

        let remote = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.trigger();
        });

        tokio::time::timeout(Duration::from_secs(1), shutdown.cancelled())
            .await
            .expect("shutdown was not observed");
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_repeated_trigger_is_harmless() {
        let shutdown = ShutdownSignal::default();
        let observer = shutdown.clone();

        for _ in 0..3 {
            shutdown.trigger();
        }

        assert!(observer.is_shutdown());
        observer.cancelled().await;
    }

    #[tokio::test]
    async fn test_signal_listener_returns_once_triggered() {
        let shutdown = ShutdownSignal::new();
        let listener = tokio::spawn(shutdown.clone().listen_for_os_signals());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener kept running")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_work_that_finishes_first() {
        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(1));
        let out = shutdown
            .drain(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                7
            })
            .await;
        assert_eq!(out, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_allows_grace_period_after_trigger() {
        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(1));
        shutdown.trigger();

        let out = shutdown
            .drain(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "drained"
            })
            .await;
        assert_eq!(out, Some("drained"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace_period() {
        let shutdown = ShutdownSignal::with_timeout(Duration::from_secs(1));
        let remote = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            remote.trigger();
        });

        let started = tokio::time::Instant::now();
        let out = shutdown.drain(std::future::pending::<()>()).await;

        assert_eq!(out, None);
        assert_eq!(started.elapsed(), Duration::from_secs(11));
    }
}
