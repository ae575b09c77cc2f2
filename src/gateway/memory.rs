//! In-memory gateway implementations.
//!
//! Used by the test harness and by local single-process experiments. The
//! queue gateway models at-least-once delivery the same way the redis
//! backend does: a received message moves to an in-flight set and is only
//! gone once deleted. The compute gateway counts start/stop calls and can
//! inject failures, so scaling behavior is observable from tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use super::{
    BlobGateway, ComputeGateway, GatewayError, InstanceId, InstanceStateFilter, QueueGateway,
    QueueId, QueueMessage,
};

/// How often `receive` re-checks an empty queue while waiting.
const RECEIVE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
}

/// In-process queue gateway.
#[derive(Debug, Default)]
pub struct MemoryQueueGateway {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueueGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all queues currently in existence.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().expect("queue map poisoned");
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of ready (not in-flight) messages in a queue.
    pub fn depth(&self, name: &str) -> usize {
        let queues = self.queues.lock().expect("queue map poisoned");
        queues.get(name).map_or(0, |state| state.ready.len())
    }
}

#[async_trait]
impl QueueGateway for MemoryQueueGateway {
    async fn create_queue(&self, name: &str) -> Result<QueueId, GatewayError> {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        queues.entry(name.to_string()).or_default();
        Ok(QueueId(name.to_string()))
    }

    async fn send(
        &self,
        queue: &QueueId,
        body: &str,
        attributes: HashMap<String, String>,
    ) -> Result<(), GatewayError> {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        queues
            .entry(queue.0.clone())
            .or_default()
            .ready
            .push_back(QueueMessage::new(body, attributes));
        Ok(())
    }

    async fn receive(
        &self,
        queue: &QueueId,
        max_wait: Duration,
    ) -> Result<Option<QueueMessage>, GatewayError> {
        let deadline = Instant::now() + max_wait;
        loop {
            {
                let mut queues = self.queues.lock().expect("queue map poisoned");
                if let Some(state) = queues.get_mut(&queue.0) {
                    if let Some(message) = state.ready.pop_front() {
                        state.in_flight.insert(message.id.clone(), message.clone());
                        return Ok(Some(message));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(RECEIVE_POLL).await;
        }
    }

    async fn delete(&self, queue: &QueueId, message: &QueueMessage) -> Result<(), GatewayError> {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        if let Some(state) = queues.get_mut(&queue.0) {
            state.in_flight.remove(&message.id);
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &QueueId) -> Result<(), GatewayError> {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        queues.remove(&queue.0);
        Ok(())
    }
}

/// In-process blob gateway over a sorted key space.
#[derive(Debug, Default)]
pub struct MemoryBlobGateway {
    objects: Mutex<BTreeMap<String, String>>,
}

impl MemoryBlobGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let objects = self.objects.lock().expect("blob map poisoned");
        objects.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobGateway for MemoryBlobGateway {
    async fn put(&self, key: &str, data: &str) -> Result<(), GatewayError> {
        let mut objects = self.objects.lock().expect("blob map poisoned");
        objects.insert(key.to_string(), data.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, GatewayError> {
        let objects = self.objects.lock().expect("blob map poisoned");
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::ObjectNotFound(key.to_string()))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let objects = self.objects.lock().expect("blob map poisoned");
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let mut objects = self.objects.lock().expect("blob map poisoned");
        objects.remove(key);
        Ok(())
    }

    async fn ensure_prefix(&self, prefix: &str) -> Result<(), GatewayError> {
        let mut objects = self.objects.lock().expect("blob map poisoned");
        objects.entry(prefix.to_string()).or_default();
        Ok(())
    }
}

#[derive(Debug)]
struct InstanceRecord {
    tags: HashMap<String, String>,
    running: bool,
}

/// In-process compute gateway with call accounting and failure injection.
#[derive(Debug, Default)]
pub struct MemoryComputeGateway {
    instances: Mutex<HashMap<String, InstanceRecord>>,
    stopped_order: Mutex<Vec<InstanceId>>,
    next_id: AtomicU64,
    start_calls: AtomicU64,
    stop_calls: AtomicU64,
    start_failures: AtomicU64,
    stop_failures: AtomicU64,
}

impl MemoryComputeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `start_instance` calls, including failed ones.
    pub fn start_calls(&self) -> u64 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Total `stop_instance` calls, including failed ones.
    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of instances currently running.
    pub fn running_count(&self) -> usize {
        let instances = self.instances.lock().expect("instance map poisoned");
        instances.values().filter(|record| record.running).count()
    }

    /// Makes the next `n` start calls fail.
    pub fn fail_next_starts(&self, n: u64) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` stop calls fail.
    pub fn fail_next_stops(&self, n: u64) {
        self.stop_failures.store(n, Ordering::SeqCst);
    }

    /// Instances successfully stopped, in stop order.
    pub fn stopped_order(&self) -> Vec<InstanceId> {
        self.stopped_order.lock().expect("stop log poisoned").clone()
    }

    fn take_induced_failure(counter: &AtomicU64) -> bool {
        if counter.load(Ordering::SeqCst) > 0 {
            counter.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

#[async_trait]
impl ComputeGateway for MemoryComputeGateway {
    async fn start_instance(
        &self,
        _image: &str,
        tags: &HashMap<String, String>,
    ) -> Result<InstanceId, GatewayError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_induced_failure(&self.start_failures) {
            return Err(GatewayError::Compute("induced start failure".to_string()));
        }

        let id = format!("i-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut instances = self.instances.lock().expect("instance map poisoned");
        instances.insert(
            id.clone(),
            InstanceRecord {
                tags: tags.clone(),
                running: true,
            },
        );
        Ok(InstanceId(id))
    }

    async fn stop_instance(&self, instance: &InstanceId) -> Result<(), GatewayError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_induced_failure(&self.stop_failures) {
            return Err(GatewayError::Compute("induced stop failure".to_string()));
        }

        let mut instances = self.instances.lock().expect("instance map poisoned");
        match instances.get_mut(&instance.0) {
            Some(record) => {
                record.running = false;
                self.stopped_order
                    .lock()
                    .expect("stop log poisoned")
                    .push(instance.clone());
                Ok(())
            }
            None => Err(GatewayError::Compute(format!(
                "unknown instance {instance}"
            ))),
        }
    }

    async fn list_instances_by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
        state: InstanceStateFilter,
    ) -> Result<Vec<InstanceId>, GatewayError> {
        let instances = self.instances.lock().expect("instance map poisoned");
        let mut ids: Vec<InstanceId> = instances
            .iter()
            .filter(|(_, record)| {
                record.tags.get(tag_key).map(String::as_str) == Some(tag_value)
                    && (state == InstanceStateFilter::Any || record.running)
            })
            .map(|(id, _)| InstanceId(id.clone()))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_roundtrip_and_ack() {
        let gateway = MemoryQueueGateway::new();
        let queue = gateway.create_queue("q").await.expect("create");

        gateway
            .send(&queue, "hello", HashMap::new())
            .await
            .expect("send");

        let message = gateway
            .receive(&queue, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("message present");
        assert_eq!(message.body, "hello");

        // Received but unacked: not ready for a second receive.
        let second = gateway
            .receive(&queue, Duration::from_millis(10))
            .await
            .expect("receive");
        assert!(second.is_none());

        gateway.delete(&queue, &message).await.expect("delete");
        assert_eq!(gateway.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let gateway = MemoryQueueGateway::new();
        let queue = gateway.create_queue("q").await.expect("create");

        let result = gateway
            .receive(&queue, Duration::from_millis(10))
            .await
            .expect("receive");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_blob_prefix_listing() {
        let gateway = MemoryBlobGateway::new();
        gateway.put("submissions/a.TASK", "x").await.expect("put");
        gateway.put("completed/a.DONE", "y").await.expect("put");
        gateway.put("submissions/b.TASK", "z").await.expect("put");

        let keys = gateway
            .list_by_prefix("submissions/")
            .await
            .expect("list");
        assert_eq!(keys, vec!["submissions/a.TASK", "submissions/b.TASK"]);

        assert!(matches!(
            gateway.get("missing").await,
            Err(GatewayError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_compute_accounting_and_failures() {
        let gateway = MemoryComputeGateway::new();
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), "worker".to_string());

        let first = gateway.start_instance("img", &tags).await.expect("start");
        gateway.fail_next_starts(1);
        assert!(gateway.start_instance("img", &tags).await.is_err());
        let third = gateway.start_instance("img", &tags).await.expect("start");

        assert_eq!(gateway.start_calls(), 3);
        assert_eq!(gateway.running_count(), 2);

        gateway.stop_instance(&third).await.expect("stop");
        assert_eq!(gateway.running_count(), 1);
        assert_eq!(gateway.stopped_order(), vec![third]);

        let running = gateway
            .list_instances_by_tag("role", "worker", InstanceStateFilter::Running)
            .await
            .expect("list");
        assert_eq!(running, vec![first]);

        let all = gateway
            .list_instances_by_tag("role", "worker", InstanceStateFilter::Any)
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
    }
}
