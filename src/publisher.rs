//! Outbox publisher.
//!
//! Relays unpublished outbox rows to the event stream on a fixed tick:
//!
//! ```text
//!   waiting ──tick──▶ draining ──batch done──▶ waiting
//!      │
//!      └──shutdown──▶ stopped
//! ```
//!
//! Delivery is at-least-once. A row whose append succeeded but whose
//! `mark_published` failed stays unpublished and is appended again on a
//! later tick; consumers must tolerate the duplicate.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::broker::StreamBroker;
use crate::event::{FIELD_AGGREGATE_ID, FIELD_EVENT_TYPE, FIELD_PAYLOAD, USER_EVENTS_STREAM};
use crate::model::PendingEvent;
use crate::shutdown::ShutdownSignal;
use crate::store::{OutboxStore, StoreError};

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Stream every row is appended to
    pub stream: String,

    /// Maximum rows fetched per tick
    pub batch_size: usize,

    /// Time between ticks
    pub poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stream: USER_EVENTS_STREAM.to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub published: usize,
    pub append_failures: usize,
    pub mark_failures: usize,
}

/// Totals over the lifetime of [`OutboxPublisher::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub ticks: u64,
    pub fetch_failures: u64,
    pub published: u64,
    pub append_failures: u64,
    pub mark_failures: u64,
}

impl PublisherStats {
    fn record(&mut self, report: &BatchReport) {
        self.published += report.published as u64;
        self.append_failures += report.append_failures as u64;
        self.mark_failures += report.mark_failures as u64;
    }
}

/// Moves outbox rows into the stream.
pub struct OutboxPublisher<O, B> {
    outbox: Arc<O>,
    broker: Arc<B>,
    config: PublisherConfig,
    span: Span,
}

impl<O: OutboxStore, B: StreamBroker> OutboxPublisher<O, B> {
    pub fn new(outbox: Arc<O>, broker: Arc<B>, config: PublisherConfig) -> Self {
        let span = info_span!("publisher", stream = %config.stream);
        Self {
            outbox,
            broker,
            config,
            span,
        }
    }

    /// Run inside `span` instead of the default `publisher` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Fetch one batch and relay it in id order.
    ///
    /// Only the fetch can fail the batch. Append and mark failures are
    /// logged, counted and left for the next tick.
    pub async fn publish_batch(&self) -> Result<BatchReport, StoreError> {
        let events = self.outbox.fetch_unpublished(self.config.batch_size).await?;
        let mut report = BatchReport {
            fetched: events.len(),
            ..BatchReport::default()
        };

        if events.is_empty() {
            debug!("No unpublished events");
            return Ok(report);
        }

        for event in &events {
            let entry_id = match self.append(event).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(
                        event_id = event.id,
                        aggregate_id = %event.aggregate_id,
                        error = %e,
                        "Failed to append event, will retry next tick"
                    );
                    report.append_failures += 1;
                    continue;
                }
            };

            if let Err(e) = self.outbox.mark_published(event.id).await {
                // The stream already holds this entry; it will be appended again.
                warn!(
                    event_id = event.id,
                    entry_id = %entry_id,
                    error = %e,
                    "Failed to mark event published"
                );
                report.mark_failures += 1;
                continue;
            }

            debug!(
                event_id = event.id,
                entry_id = %entry_id,
                event_type = %event.event_type,
                "Event published"
            );
            report.published += 1;
        }

        info!(
            fetched = report.fetched,
            published = report.published,
            append_failures = report.append_failures,
            mark_failures = report.mark_failures,
            "Batch processed"
        );
        Ok(report)
    }

    async fn append(&self, event: &PendingEvent) -> Result<String, crate::broker::BrokerError> {
        let fields: [(&str, &[u8]); 3] = [
            (FIELD_EVENT_TYPE, event.event_type.as_bytes()),
            (FIELD_AGGREGATE_ID, event.aggregate_id.as_bytes()),
            (FIELD_PAYLOAD, &event.payload),
        ];
        self.broker.append(&self.config.stream, &fields).await
    }

    /// Drain a batch every `poll_interval` until `shutdown` fires.
    ///
    /// The first tick comes one full interval after start. A batch that is
    /// already running when shutdown fires completes; only the next tick is
    /// skipped.
    pub async fn run(&self, shutdown: ShutdownSignal) -> PublisherStats {
        let span = self.span.clone();

        async move {
            let period = self.config.poll_interval;
            info!(
                batch_size = self.config.batch_size,
                poll_interval_ms = period.as_millis() as u64,
                "Publisher started"
            );

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut stats = PublisherStats::default();

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                stats.ticks += 1;
                match self.publish_batch().await {
                    Ok(report) => stats.record(&report),
                    Err(e) => {
                        stats.fetch_failures += 1;
                        error!(error = %e, "Failed to fetch unpublished events");
                    }
                }
            }

            info!(
                ticks = stats.ticks,
                published = stats.published,
                append_failures = stats.append_failures,
                mark_failures = stats.mark_failures,
                "Publisher stopped"
            );
            stats
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{BrokerError, GroupSetup};
    use crate::event::StreamMessage;
    use crate::model::NewPendingEvent;
    use crate::store::memory::{MemoryDatabase, MemoryTx};
    use crate::store::{Transaction, TransactionManager};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const STREAM: &str = "user:events";

    async fn insert(db: &MemoryDatabase, aggregate: &str) -> PendingEvent {
        let mut tx = db.begin().await.unwrap();
        let row = db
            .create_pending_event(
                &mut tx,
                NewPendingEvent::new(aggregate, "user_created", aggregate.as_bytes().to_vec()),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        row
    }

    fn aggregates(broker: &MemoryBroker) -> Vec<String> {
        broker
            .entries(STREAM)
            .iter()
            .filter_map(|m| m.field_str(FIELD_AGGREGATE_ID))
            .collect()
    }

    /// Outbox whose `mark_published` fails while `failing` is set.
    struct FlakyMarks {
        db: MemoryDatabase,
        failing: AtomicBool,
    }

    #[async_trait]
    impl OutboxStore for FlakyMarks {
        type Tx = MemoryTx;

        async fn create_pending_event(
            &self,
            tx: &mut MemoryTx,
            event: NewPendingEvent,
        ) -> Result<PendingEvent, StoreError> {
            self.db.create_pending_event(tx, event).await
        }

        async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<PendingEvent>, StoreError> {
            self.db.fetch_unpublished(limit).await
        }

        async fn mark_published(&self, id: i64) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.db.mark_published(id).await
        }

        async fn count_unpublished(&self) -> Result<u64, StoreError> {
            self.db.count_unpublished().await
        }
    }

    /// Memory broker with slow appends and an optional aggregate it refuses.
    struct StubbornBroker {
        inner: MemoryBroker,
        reject: Option<String>,
        append_delay: Duration,
    }

    impl StubbornBroker {
        fn rejecting(inner: MemoryBroker, aggregate: &str) -> Self {
            Self {
                inner,
                reject: Some(aggregate.to_string()),
                append_delay: Duration::ZERO,
            }
        }

        fn slow(inner: MemoryBroker, append_delay: Duration) -> Self {
            Self {
                inner,
                reject: None,
                append_delay,
            }
        }
    }

    #[async_trait]
    impl StreamBroker for StubbornBroker {
        async fn append(
            &self,
            stream: &str,
            fields: &[(&str, &[u8])],
        ) -> Result<String, BrokerError> {
            if !self.append_delay.is_zero() {
                tokio::time::sleep(self.append_delay).await;
            }
            let rejected = self.reject.as_deref().is_some_and(|reject| {
                fields
                    .iter()
                    .any(|(k, v)| *k == FIELD_AGGREGATE_ID && *v == reject.as_bytes())
            });
            if rejected {
                return Err(BrokerError::Unavailable("stream full".into()));
            }
            self.inner.append(stream, fields).await
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError> {
            self.inner.ensure_group(stream, group).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> Result<Vec<StreamMessage>, BrokerError> {
            self.inner.read_group(stream, group, consumer, count, block).await
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BrokerError> {
            self.inner.ack(stream, group, id).await
        }

        async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
            self.inner.pending_count(stream, group).await
        }
    }

    fn config(batch_size: usize) -> PublisherConfig {
        PublisherConfig {
            batch_size,
            ..PublisherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_publishes_in_id_order_and_marks() {
        let db = MemoryDatabase::new();
        let broker = MemoryBroker::new();
        for i in 1..=3 {
            insert(&db, &format!("user_{}", i)).await;
        }

        let publisher =
            OutboxPublisher::new(Arc::new(db.clone()), Arc::new(broker.clone()), config(10));
        let report = publisher.publish_batch().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.published, 3);
        assert_eq!(aggregates(&broker), vec!["user_1", "user_2", "user_3"]);
        assert_eq!(db.count_unpublished().await.unwrap(), 0);

        let entry = &broker.entries(STREAM)[0];
        assert_eq!(entry.field_str(FIELD_EVENT_TYPE).as_deref(), Some("user_created"));
        assert_eq!(entry.field(FIELD_PAYLOAD), Some(&b"user_1"[..]));
    }

    #[tokio::test]
    async fn test_batch_size_bounds_each_tick() {
        let db = MemoryDatabase::new();
        let broker = MemoryBroker::new();
        for i in 1..=5 {
            insert(&db, &format!("user_{}", i)).await;
        }

        let publisher =
            OutboxPublisher::new(Arc::new(db.clone()), Arc::new(broker.clone()), config(2));
        assert_eq!(publisher.publish_batch().await.unwrap().published, 2);
        assert_eq!(db.count_unpublished().await.unwrap(), 3);

        publisher.publish_batch().await.unwrap();
        assert_eq!(aggregates(&broker), vec!["user_1", "user_2", "user_3", "user_4"]);
    }

    #[tokio::test]
    async fn test_empty_outbox_publishes_nothing() {
        let publisher = OutboxPublisher::new(
            Arc::new(MemoryDatabase::new()),
            Arc::new(MemoryBroker::new()),
            config(10),
        );
        assert_eq!(publisher.publish_batch().await.unwrap(), BatchReport::default());
    }

    #[tokio::test]
    async fn test_append_failure_skips_event_and_continues() {
        let db = MemoryDatabase::new();
        let inner = MemoryBroker::new();
        insert(&db, "user_1").await;
        insert(&db, "user_2").await;
        insert(&db, "user_3").await;

        let broker = StubbornBroker::rejecting(inner.clone(), "user_2");
        let publisher = OutboxPublisher::new(Arc::new(db.clone()), Arc::new(broker), config(10));
        let report = publisher.publish_batch().await.unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(report.append_failures, 1);
        assert_eq!(aggregates(&inner), vec!["user_1", "user_3"]);

        let left = db.fetch_unpublished(10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].aggregate_id, "user_2");
    }

    #[tokio::test]
    async fn test_mark_failure_republishes_next_tick() {
        let db = MemoryDatabase::new();
        let broker = MemoryBroker::new();
        insert(&db, "user_1").await;

        let outbox = Arc::new(FlakyMarks {
            db: db.clone(),
            failing: AtomicBool::new(true),
        });
        let publisher = OutboxPublisher::new(outbox.clone(), Arc::new(broker.clone()), config(10));

        let first = publisher.publish_batch().await.unwrap();
        assert_eq!(first.mark_failures, 1);
        assert_eq!(first.published, 0);
        assert_eq!(db.count_unpublished().await.unwrap(), 1);

        outbox.failing.store(false, Ordering::SeqCst);
        let second = publisher.publish_batch().await.unwrap();
        assert_eq!(second.published, 1);

        // Same logical event twice downstream.
        assert_eq!(aggregates(&broker), vec!["user_1", "user_1"]);
        assert_eq!(db.count_unpublished().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let db = MemoryDatabase::new();
        let broker = MemoryBroker::new();
        insert(&db, "user_1").await;

        let publisher = Arc::new(OutboxPublisher::new(
            Arc::new(db.clone()),
            Arc::new(broker.clone()),
            config(10),
        ));
        let shutdown = ShutdownSignal::new();
        let handle = {
            let publisher = publisher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.run(shutdown).await })
        };

        // Nothing before the first full interval.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(broker.entries(STREAM).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(aggregates(&broker), vec!["user_1"]);

        shutdown.trigger();
        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_immediately_when_already_shut_down() {
        let db = MemoryDatabase::new();
        insert(&db, "user_1").await;
        let publisher =
            OutboxPublisher::new(Arc::new(db.clone()), Arc::new(MemoryBroker::new()), config(10));

        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let stats = publisher.run(shutdown).await;
        assert_eq!(stats.ticks, 0);
        assert_eq!(db.count_unpublished().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_batch_finishes_the_batch() {
        let db = MemoryDatabase::new();
        let inner = MemoryBroker::new();
        for i in 1..=5 {
            insert(&db, &format!("user_{}", i)).await;
        }

        let broker = StubbornBroker::slow(inner.clone(), Duration::from_millis(100));
        let publisher = Arc::new(OutboxPublisher::new(
            Arc::new(db.clone()),
            Arc::new(broker),
            PublisherConfig {
                poll_interval: Duration::from_secs(1),
                ..config(10)
            },
        ));
        let shutdown = ShutdownSignal::new();
        let handle = {
            let publisher = publisher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.run(shutdown).await })
        };

        // First tick at 1s; the five appends take until 1.5s.
        tokio::time::sleep(Duration::from_millis(1150)).await;
        assert!(aggregates(&inner).len() < 5);
        shutdown.trigger();

        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.published, 5);
        assert_eq!(inner.entries(STREAM).len(), 5);
        assert_eq!(db.count_unpublished().await.unwrap(), 0);
    }
}
