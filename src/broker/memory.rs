//! In-process stream broker.
//!
//! Mirrors the Redis Streams consumer-group contract closely enough for the
//! pipeline to run without a server: each group has a delivery cursor, an
//! entry delivered to one consumer is pending until acknowledged, and a
//! blocking read waits for new entries up to its timeout.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BrokerError, GroupSetup, StreamBroker};
use crate::event::StreamMessage;

#[derive(Debug, Default)]
struct ConsumerGroup {
    /// Index of the next entry never delivered to this group.
    cursor: usize,
    /// Pending entry id -> consumer it was delivered to.
    pending: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<StreamMessage>,
    groups: HashMap<String, ConsumerGroup>,
    last_seq: u64,
}

/// [`StreamBroker`] that keeps every stream in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    streams: Arc<Mutex<HashMap<String, StreamLog>>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamLog>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every entry ever appended to `stream`, in append order.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        self.streams()
            .get(stream)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Pending entry ids of `group`, oldest first.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.streams()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn take_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut streams = self.streams();
        let log = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let end = (state.cursor + count.max(1)).min(entries.len());
        let batch: Vec<StreamMessage> = entries[state.cursor..end].to_vec();
        state.cursor = end;
        for msg in &batch {
            state.pending.insert(msg.id.clone(), consumer.to_string());
        }
        Ok(batch)
    }
}

fn no_group(stream: &str, group: &str) -> BrokerError {
    BrokerError::Unavailable(format!(
        "NOGROUP no consumer group '{}' for stream '{}'",
        group, stream
    ))
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<String, BrokerError> {
        let id = {
            let mut streams = self.streams();
            let log = streams.entry(stream.to_string()).or_default();
            log.last_seq += 1;
            let id = format!("{}-0", log.last_seq);

            let mut msg = StreamMessage::new(id.clone());
            for (name, value) in fields {
                msg.fields.insert((*name).to_string(), value.to_vec());
            }
            log.entries.push(msg);
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError> {
        let mut streams = self.streams();
        let log = streams.entry(stream.to_string()).or_default();

        if log.groups.contains_key(group) {
            return Ok(GroupSetup::AlreadyExisted);
        }
        log.groups.insert(group.to_string(), ConsumerGroup::default());
        Ok(GroupSetup::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking so an append in between is not missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.take_batch(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BrokerError> {
        let mut streams = self.streams();
        let removed = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .map(|g| g.pending.remove(id).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let streams = self.streams();
        let group_state = streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(group_state.pending.len() as u64)
    }
}
