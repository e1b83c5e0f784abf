//! Redis Streams broker.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerError, GroupSetup, StreamBroker};
use crate::event::StreamMessage;

/// Group start id: deliver everything already in the stream.
const GROUP_START_ID: &str = "0";

/// [`StreamBroker`] backed by a pooled Redis client.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
}

impl RedisBroker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        let mut conn = pool.get().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;

        info!(url = %url, "Connected to Redis");
        Ok(Self { pool })
    }
}

/// Convert a raw stream field value into bytes.
fn value_bytes(value: &RedisValue) -> Option<Vec<u8>> {
    match value {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        RedisValue::Int(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

fn to_message(id: String, map: &HashMap<String, RedisValue>) -> StreamMessage {
    let fields = map
        .iter()
        .filter_map(|(k, v)| value_bytes(v).map(|bytes| (k.clone(), bytes)))
        .collect();
    StreamMessage { id, fields }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<String, BrokerError> {
        let mut conn = self.pool.get().await?;
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError> {
        let mut conn = self.pool.get().await?;
        let result: Result<(), _> = conn
            .xgroup_create_mkstream(stream, group, GROUP_START_ID)
            .await;

        match result {
            Ok(()) => Ok(GroupSetup::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupSetup::AlreadyExisted),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block.as_millis() as usize)
            .count(count);

        // BLOCK timeouts come back as nil.
        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &opts).await?;

        let messages: Vec<StreamMessage> = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| to_message(entry.id, &entry.map))
                    .collect()
            })
            .unwrap_or_default();

        debug!(stream = %stream, count = messages.len(), "Read from consumer group");
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BrokerError> {
        let mut conn = self.pool.get().await?;
        let acked: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(acked > 0)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let mut conn = self.pool.get().await?;
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FIELD_EVENT_TYPE, FIELD_PAYLOAD};

    #[test]
    fn test_value_bytes() {
        assert_eq!(
            value_bytes(&RedisValue::BulkString(b"user_created".to_vec())),
            Some(b"user_created".to_vec())
        );
        assert_eq!(
            value_bytes(&RedisValue::SimpleString("ok".to_string())),
            Some(b"ok".to_vec())
        );
        assert_eq!(value_bytes(&RedisValue::Nil), None);
    }

    #[test]
    fn test_to_message_drops_unreadable_fields() {
        let mut map = HashMap::new();
        map.insert(
            FIELD_EVENT_TYPE.to_string(),
            RedisValue::BulkString(b"user_created".to_vec()),
        );
        map.insert(FIELD_PAYLOAD.to_string(), RedisValue::Nil);

        let msg = to_message("1-0".to_string(), &map);
        assert_eq!(msg.id, "1-0");
        assert_eq!(msg.field_str(FIELD_EVENT_TYPE).as_deref(), Some("user_created"));
        assert!(msg.field(FIELD_PAYLOAD).is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_group_setup_is_idempotent() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let broker = RedisBroker::connect(&url).await.unwrap();
        let stream = format!("test:{}", uuid::Uuid::new_v4());

        assert_eq!(broker.ensure_group(&stream, "g").await.unwrap(), GroupSetup::Created);
        assert_eq!(
            broker.ensure_group(&stream, "g").await.unwrap(),
            GroupSetup::AlreadyExisted
        );

        broker.append(&stream, &[(FIELD_EVENT_TYPE, b"t")]).await.unwrap();
        let batch = broker
            .read_group(&stream, "g", "c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(broker.pending_count(&stream, "g").await.unwrap(), 1);
        assert!(broker.ack(&stream, "g", &batch[0].id).await.unwrap());
        assert_eq!(broker.pending_count(&stream, "g").await.unwrap(), 0);
    }
}
