//! Consumer-group reader.
//!
//! Reads the event stream through a consumer group and hands each entry to
//! the [`Dispatcher`]. An entry is acknowledged only when its dispatch
//! succeeded (an unknown event type counts as success). Anything else stays
//! pending in the group for an operator to inspect; nothing is reclaimed or
//! redelivered automatically.
//!
//! ```text
//!   ┌──────────────┐  entries  ┌─────────────┐  ok   ┌─────┐
//!   │ blocked read │ ────────▶ │ dispatching │ ────▶ │ ack │
//!   └──────────────┘           └─────────────┘       └─────┘
//!          ▲   │ read error          │ error
//!          │   ▼                     ▼
//!        fixed delay             left pending
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::broker::{BrokerError, GroupSetup, StreamBroker};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::event::{
    StreamMessage, EMAIL_SERVICE_GROUP, FIELD_EVENT_TYPE, FIELD_PAYLOAD, USER_EVENTS_STREAM,
};
use crate::handlers::HandlerError;
use crate::shutdown::ShutdownSignal;

/// Log consumer statistics every this many received entries.
const STATS_LOG_EVERY: u64 = 100;

/// Per-entry consumption failures. The entry is never acknowledged.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("entry {entry_id} is missing required field '{field}'")]
    MissingField {
        entry_id: String,
        field: &'static str,
    },

    #[error("failed to decode '{event_type}' payload: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,

    /// Name of this consumer within the group
    pub consumer_name: String,

    /// Maximum entries per read
    pub batch_count: usize,

    /// How long one read blocks waiting for entries
    pub block_timeout: Duration,

    /// Pause after a failed read before reading again
    pub error_retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: USER_EVENTS_STREAM.to_string(),
            group: EMAIL_SERVICE_GROUP.to_string(),
            consumer_name: "consumer-1".to_string(),
            batch_count: 1,
            block_timeout: Duration::from_millis(1000),
            error_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of one read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub received: usize,
    pub acked: usize,
    pub failed: usize,
}

/// Totals over the lifetime of [`StreamConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub reads: u64,
    pub read_errors: u64,
    pub received: u64,
    pub acked: u64,
    pub failed: u64,
}

impl ConsumerStats {
    fn record(&mut self, report: &ConsumeReport) {
        self.received += report.received as u64;
        self.acked += report.acked as u64;
        self.failed += report.failed as u64;
    }
}

/// Reads one consumer group and dispatches what it receives.
pub struct StreamConsumer<B> {
    broker: Arc<B>,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    span: Span,
}

impl<B: StreamBroker> StreamConsumer<B> {
    pub fn new(broker: Arc<B>, dispatcher: Arc<Dispatcher>, config: ConsumerConfig) -> Self {
        let span = info_span!(
            "consumer",
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer_name
        );
        Self {
            broker,
            dispatcher,
            config,
            span,
        }
    }

    /// Run inside `span` instead of the default `consumer` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Make sure the stream and group exist. Safe to call repeatedly.
    ///
    /// Entries left pending by earlier runs are reported but not reclaimed.
    pub async fn setup(&self) -> Result<GroupSetup, BrokerError> {
        async {
            let setup = self
                .broker
                .ensure_group(&self.config.stream, &self.config.group)
                .await?;

            match setup {
                GroupSetup::Created => info!("Created consumer group"),
                GroupSetup::AlreadyExisted => info!("Consumer group already exists"),
            }

            match self
                .broker
                .pending_count(&self.config.stream, &self.config.group)
                .await
            {
                Ok(0) => {}
                Ok(pending) => warn!(pending, "Consumer group has unacknowledged entries"),
                Err(e) => warn!(error = %e, "Failed to read pending count"),
            }

            Ok(setup)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Validate one entry and dispatch it. Does not acknowledge.
    pub async fn process_message(
        &self,
        msg: &StreamMessage,
    ) -> Result<DispatchOutcome, ConsumeError> {
        let event_type = msg
            .field_str(FIELD_EVENT_TYPE)
            .ok_or_else(|| ConsumeError::MissingField {
                entry_id: msg.id.clone(),
                field: FIELD_EVENT_TYPE,
            })?;
        let payload = msg.field(FIELD_PAYLOAD).ok_or_else(|| ConsumeError::MissingField {
            entry_id: msg.id.clone(),
            field: FIELD_PAYLOAD,
        })?;

        debug!(entry_id = %msg.id, event_type = %event_type, "Processing entry");
        self.dispatcher.dispatch(&event_type, payload).await
    }

    /// Handle one entry; returns whether it was acknowledged.
    async fn handle(&self, msg: &StreamMessage) -> bool {
        if let Err(e) = self.process_message(msg).await {
            error!(entry_id = %msg.id, error = %e, "Failed to process entry, leaving it pending");
            return false;
        }

        match self
            .broker
            .ack(&self.config.stream, &self.config.group, &msg.id)
            .await
        {
            Ok(true) => {
                debug!(entry_id = %msg.id, "Entry acknowledged");
                true
            }
            Ok(false) => {
                warn!(entry_id = %msg.id, "Entry was not pending when acknowledged");
                true
            }
            Err(e) => {
                error!(entry_id = %msg.id, error = %e, "Failed to acknowledge entry");
                false
            }
        }
    }

    /// One blocking read and the dispatch of everything it returned.
    ///
    /// A read timeout is an empty report, not an error.
    pub async fn consume_once(&self) -> Result<ConsumeReport, BrokerError> {
        let messages = self
            .broker
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_name,
                self.config.batch_count,
                self.config.block_timeout,
            )
            .await?;

        let mut report = ConsumeReport {
            received: messages.len(),
            ..ConsumeReport::default()
        };

        for msg in &messages {
            if self.handle(msg).await {
                report.acked += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Read and dispatch until `shutdown` fires.
    ///
    /// Shutdown is checked before each read, so an in-flight read and its
    /// dispatch always complete. A read is never abandoned mid-flight: the
    /// broker may already have delivered its entries to this consumer, and
    /// dropping the reply would strand them in the pending list. Stopping an
    /// idle consumer therefore takes up to `block_timeout`. Read errors are
    /// retried after `error_retry_delay`.
    pub async fn run(&self, shutdown: ShutdownSignal) -> ConsumerStats {
        let span = self.span.clone();

        async move {
            info!(
                batch_count = self.config.batch_count,
                block_timeout_ms = self.config.block_timeout.as_millis() as u64,
                "Consumer started"
            );

            let mut stats = ConsumerStats::default();
            let mut last_logged = 0;

            while !shutdown.is_shutdown() {
                stats.reads += 1;

                match self.consume_once().await {
                    Ok(report) => stats.record(&report),
                    Err(e) => {
                        stats.read_errors += 1;
                        error!(
                            error = %e,
                            retry_in_ms = self.config.error_retry_delay.as_millis() as u64,
                            "Stream read failed"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(self.config.error_retry_delay) => {}
                        }
                        continue;
                    }
                }

                if stats.received / STATS_LOG_EVERY > last_logged {
                    last_logged = stats.received / STATS_LOG_EVERY;
                    info!(
                        received = stats.received,
                        acked = stats.acked,
                        failed = stats.failed,
                        "Consumer statistics"
                    );
                }
            }

            info!(
                received = stats.received,
                acked = stats.acked,
                failed = stats.failed,
                read_errors = stats.read_errors,
                "Consumer stopped"
            );
            stats
        }
        .instrument(span)
        .await
    }
}
