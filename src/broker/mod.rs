//! Append-only stream broker with consumer groups.
//!
//! The broker is an external collaborator. [`StreamBroker`] captures the
//! handful of operations the pipeline needs so it can run against Redis
//! Streams ([`redis::RedisBroker`]) or an in-process log
//! ([`memory::MemoryBroker`]).

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::event::StreamMessage;

/// Errors from the stream broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis command error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("Redis connection error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Redis pool setup error: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Result of asking for a consumer group to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSetup {
    Created,
    AlreadyExisted,
}

/// Operations on an append-only stream log.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append an entry and return its broker-assigned id.
    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<String, BrokerError>;

    /// Create `group` on `stream` (creating the stream if needed), reading
    /// from the start of the log. An existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError>;

    /// Read up to `count` entries never delivered to `group`, blocking for
    /// at most `block`. A timeout returns an empty batch.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Acknowledge an entry. Returns `false` if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BrokerError>;

    /// Entries delivered to `group` but not yet acknowledged.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError>;
}
