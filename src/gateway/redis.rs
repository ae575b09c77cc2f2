//! Redis-backed queue and blob gateways.
//!
//! Queues are Redis lists. Receiving uses BRPOPLPUSH to atomically move
//! the message into a per-queue processing list, so a crashed consumer
//! leaves the message recoverable; acknowledging removes it from the
//! processing list. Blobs are plain namespaced keys with SCAN-based
//! prefix listing.
//!
//! All keys live under a configurable namespace so several farms can
//! share one Redis instance:
//!
//! - `{namespace}:queue:{name}`: ready messages
//! - `{namespace}:queue:{name}:processing`: received, unacknowledged
//! - `{namespace}:blob:{key}`: stored objects

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{BlobGateway, GatewayError, QueueGateway, QueueId, QueueMessage};

/// Opens a managed connection suitable for sharing across gateways.
pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager, GatewayError> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))
}

fn queue_err(e: redis::RedisError) -> GatewayError {
    GatewayError::Queue(e.to_string())
}

fn blob_err(e: redis::RedisError) -> GatewayError {
    GatewayError::Blob(e.to_string())
}

/// Queue gateway over Redis lists.
pub struct RedisQueueGateway {
    redis: ConnectionManager,
    namespace: String,
}

impl RedisQueueGateway {
    /// Connects to Redis and creates a new queue gateway.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, GatewayError> {
        let redis = connect_manager(redis_url).await?;
        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a queue gateway from an existing connection manager.
    ///
    /// Useful when sharing one connection pool across gateways.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
        }
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    fn processing_key(queue: &QueueId) -> String {
        format!("{}:processing", queue.0)
    }
}

#[async_trait]
impl QueueGateway for RedisQueueGateway {
    async fn create_queue(&self, name: &str) -> Result<QueueId, GatewayError> {
        // Redis lists come into existence on first push; the handle is
        // enough.
        Ok(QueueId(self.queue_key(name)))
    }

    async fn send(
        &self,
        queue: &QueueId,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), GatewayError> {
        let envelope = serde_json::to_string(&QueueMessage::new(body, attributes))?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&queue.0, envelope)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &QueueId,
        max_wait: Duration,
    ) -> Result<Option<QueueMessage>, GatewayError> {
        let mut conn = self.redis.clone();
        let timeout_secs = max_wait.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from the ready list and pushes to the
        // processing list.
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&queue.0)
            .arg(Self::processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;

        match raw {
            Some(data) => {
                let message: QueueMessage = serde_json::from_str(&data)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, queue: &QueueId, message: &QueueMessage) -> Result<(), GatewayError> {
        let mut conn = self.redis.clone();
        let processing = Self::processing_key(queue);

        let entries: Vec<String> = conn
            .lrange(&processing, 0, -1)
            .await
            .map_err(queue_err)?;

        for entry in entries {
            if let Ok(parsed) = serde_json::from_str::<QueueMessage>(&entry) {
                if parsed.id == message.id {
                    conn.lrem::<_, _, ()>(&processing, 1, &entry)
                        .await
                        .map_err(queue_err)?;
                    return Ok(());
                }
            }
        }

        // Already acknowledged elsewhere; at-least-once makes this benign.
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueId) -> Result<(), GatewayError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(&queue.0).del(Self::processing_key(queue));
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(())
    }
}

/// Blob gateway over namespaced Redis keys.
pub struct RedisBlobGateway {
    redis: ConnectionManager,
    namespace: String,
}

impl RedisBlobGateway {
    /// Connects to Redis and creates a new blob gateway.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, GatewayError> {
        let redis = connect_manager(redis_url).await?;
        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a blob gateway from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
        }
    }

    fn blob_key(&self, key: &str) -> String {
        format!("{}:blob:{}", self.namespace, key)
    }

    fn key_prefix_len(&self) -> usize {
        self.namespace.len() + ":blob:".len()
    }
}

#[async_trait]
impl BlobGateway for RedisBlobGateway {
    async fn put(&self, key: &str, data: &str) -> Result<(), GatewayError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.blob_key(key), data)
            .await
            .map_err(blob_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, GatewayError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(self.blob_key(key)).await.map_err(blob_err)?;
        value.ok_or_else(|| GatewayError::ObjectNotFound(key.to_string()))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", self.blob_key(prefix));
        let strip = self.key_prefix_len();

        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> =
                conn.scan_match(pattern).await.map_err(blob_err)?;
            while let Some(key) = iter.next_item().await {
                keys.push(key[strip..].to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.blob_key(key))
            .await
            .map_err(blob_err)?;
        Ok(())
    }

    async fn ensure_prefix(&self, prefix: &str) -> Result<(), GatewayError> {
        let mut conn = self.redis.clone();
        conn.set_nx::<_, _, bool>(self.blob_key(prefix), "")
            .await
            .map_err(blob_err)?;
        Ok(())
    }
}
