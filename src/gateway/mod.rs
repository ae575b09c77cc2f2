//! External capability gateways: queues, blobs and compute.
//!
//! The orchestration engine never talks to a backend directly; it consumes
//! three narrow trait objects defined here. Backends provided:
//!
//! - **redis**: queues and blobs on a shared Redis connection, with
//!   at-least-once receive via a per-queue processing list
//! - **docker**: compute instances as labeled containers
//! - **memory**: in-process gateways for tests and local runs
//!
//! # Naming conventions
//!
//! The farm relies on reserved names: three fixed control queues, a
//! deterministic per-client reply queue, and key prefixes that partition
//! the blob namespace. The client identifier always travels as a message
//! attribute, never embedded in the body.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod docker;
pub mod memory;
pub mod redis;

pub use docker::DockerComputeGateway;
pub use memory::{MemoryBlobGateway, MemoryComputeGateway, MemoryQueueGateway};
pub use redis::{RedisBlobGateway, RedisQueueGateway};

/// Queue carrying client submissions to the coordinator.
pub const SUBMISSION_QUEUE: &str = "client-submissions";
/// Queue carrying per-batch worker results back to the coordinator.
pub const RESULT_QUEUE: &str = "worker-results";
/// Queue carrying dispatched batches from the coordinator to workers.
pub const DISPATCH_QUEUE: &str = "coordinator-dispatch";

/// Blob prefix for uploaded task lists.
pub const SUBMISSION_PREFIX: &str = "submissions/";
/// Blob prefix for completed client reports.
pub const COMPLETED_PREFIX: &str = "completed/";
/// Blob prefix for derived per-client artifacts.
pub const OUTPUT_PREFIX: &str = "customer-files/";
/// Blob prefix for deployable code bundles; survives farm teardown.
pub const BUNDLE_PREFIX: &str = "bundles/";

/// Reserved submission body signaling cooperative shutdown.
pub const SHUTDOWN_SENTINEL: &str = "TERMINATE";
/// Message attribute carrying the owning client identifier.
pub const CLIENT_ID_ATTR: &str = "client-id";

/// Instance tag key identifying a farm role.
pub const ROLE_TAG: &str = "role";
/// Tag value for worker instances.
pub const WORKER_ROLE: &str = "worker";
/// Tag value for the coordinator instance.
pub const COORDINATOR_ROLE: &str = "coordinator";

/// Blob key a client uploads its task list under.
pub fn submission_key(client_id: &str) -> String {
    format!("{SUBMISSION_PREFIX}{client_id}.TASK")
}

/// Blob key the coordinator writes a completed report under.
pub fn completed_key(client_id: &str) -> String {
    format!("{COMPLETED_PREFIX}{client_id}.DONE")
}

/// Deterministic name of a client's reply queue.
pub fn reply_queue_name(client_id: &str) -> String {
    format!("reply-{client_id}")
}

/// Errors surfaced by gateway backends.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Could not establish a connection to the backend.
    #[error("gateway connection failed: {0}")]
    ConnectionFailed(String),

    /// Queue backend operation failed.
    #[error("queue backend error: {0}")]
    Queue(String),

    /// Blob backend operation failed.
    #[error("blob backend error: {0}")]
    Blob(String),

    /// Compute backend operation failed.
    #[error("compute backend error: {0}")]
    Compute(String),

    /// The requested blob does not exist.
    #[error("object '{0}' not found")]
    ObjectNotFound(String),

    /// A message envelope could not be encoded or decoded.
    #[error("message payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Opaque handle to a named durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub String);

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a queue.
///
/// `id` doubles as the receipt handle used to acknowledge (delete) the
/// message after handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message/receipt identifier.
    pub id: String,
    /// Message body.
    pub body: String,
    /// Flat string-keyed attribute map.
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    /// Creates a new message envelope with a fresh identifier.
    pub fn new(body: impl Into<String>, attributes: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            attributes,
        }
    }

    /// Convenience constructor for a message tagged with a client id.
    pub fn for_client(body: impl Into<String>, client_id: &str) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(CLIENT_ID_ATTR.to_string(), client_id.to_string());
        Self::new(body, attributes)
    }

    /// Returns the client identifier attribute, if present.
    pub fn client_id(&self) -> Option<&str> {
        self.attributes.get(CLIENT_ID_ATTR).map(String::as_str)
    }
}

/// Filter applied when listing compute instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStateFilter {
    /// Only instances currently running.
    Running,
    /// Instances in any lifecycle state.
    Any,
}

/// Send/receive/delete on named durable queues.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Returns a handle to the named queue, creating it if absent.
    async fn create_queue(&self, name: &str) -> Result<QueueId, GatewayError>;

    /// Publishes a message with the given attributes.
    async fn send(
        &self,
        queue: &QueueId,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), GatewayError>;

    /// Receives at most one message, waiting up to `max_wait`.
    ///
    /// Delivery is at-least-once: a received message stays recoverable
    /// until it is acknowledged with [`QueueGateway::delete`].
    async fn receive(
        &self,
        queue: &QueueId,
        max_wait: Duration,
    ) -> Result<Option<QueueMessage>, GatewayError>;

    /// Acknowledges (deletes) a previously received message.
    async fn delete(&self, queue: &QueueId, message: &QueueMessage) -> Result<(), GatewayError>;

    /// Deletes the queue and everything still in it.
    async fn delete_queue(&self, queue: &QueueId) -> Result<(), GatewayError>;
}

/// Key-addressed object storage.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// Writes an object, replacing any previous value.
    async fn put(&self, key: &str, data: &str) -> Result<(), GatewayError>;

    /// Reads an object as text.
    async fn get(&self, key: &str) -> Result<String, GatewayError>;

    /// Lists keys under a prefix. An empty prefix lists everything.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError>;

    /// Deletes an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;

    /// Ensures a prefix marker exists so listings work before first write.
    async fn ensure_prefix(&self, prefix: &str) -> Result<(), GatewayError>;
}

/// Start/stop tagged compute instances.
#[async_trait]
pub trait ComputeGateway: Send + Sync {
    /// Starts one instance from the given image, applying the tags.
    async fn start_instance(
        &self,
        image: &str,
        tags: &HashMap<String, String>,
    ) -> Result<InstanceId, GatewayError>;

    /// Stops and deprovisions an instance.
    async fn stop_instance(&self, instance: &InstanceId) -> Result<(), GatewayError>;

    /// Lists instances carrying the given tag, optionally restricted to
    /// running ones.
    async fn list_instances_by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
        state: InstanceStateFilter,
    ) -> Result<Vec<InstanceId>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        assert_eq!(submission_key("abc"), "submissions/abc.TASK");
        assert_eq!(completed_key("abc"), "completed/abc.DONE");
        assert_eq!(reply_queue_name("abc"), "reply-abc");
    }

    #[test]
    fn test_sentinel_is_not_a_submission_key() {
        assert!(!SHUTDOWN_SENTINEL.starts_with(SUBMISSION_PREFIX));
    }

    #[test]
    fn test_message_client_id() {
        let message = QueueMessage::for_client("body", "client-7");
        assert_eq!(message.client_id(), Some("client-7"));

        let message = QueueMessage::new("body", HashMap::new());
        assert_eq!(message.client_id(), None);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = QueueMessage::new("x", HashMap::new());
        let b = QueueMessage::new("x", HashMap::new());
        assert_ne!(a.id, b.id);
    }
}
