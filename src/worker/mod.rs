//! Worker runtime: consumes dispatched batches, applies document
//! transforms and reports one outcome line per task.
//!
//! Workers are stateless. Each batch is processed independently: every
//! task line yields exactly one outcome line (success with the artifact
//! key, or the error inline), so a malformed line or a failed fetch
//! never aborts the rest of the batch. The per-batch outcome block is
//! sent back tagged with the owning client id.

pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::FarmConfig;
use crate::gateway::{
    BlobGateway, GatewayError, QueueGateway, QueueId, QueueMessage, CLIENT_ID_ATTR,
    DISPATCH_QUEUE, RESULT_QUEUE,
};
use crate::task::TaskBatch;

pub use transform::{DocumentTransformer, TransformError};

/// Errors that can occur in the worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A gateway call failed.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The transformer could not be constructed.
    #[error("transformer initialization failed: {0}")]
    Init(#[from] TransformError),
}

/// Long-lived batch-processing loop.
pub struct WorkerRuntime {
    queues: Arc<dyn QueueGateway>,
    transformer: DocumentTransformer,
    dispatch_queue: QueueId,
    result_queue: QueueId,
    poll_wait: Duration,
}

impl WorkerRuntime {
    /// Creates a worker runtime bound to the farm's control queues.
    pub async fn new(
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        config: &FarmConfig,
    ) -> Result<Self, WorkerError> {
        let dispatch_queue = queues.create_queue(DISPATCH_QUEUE).await?;
        let result_queue = queues.create_queue(RESULT_QUEUE).await?;
        let transformer = DocumentTransformer::new(blob, config.http_timeout)?;

        Ok(Self {
            queues,
            transformer,
            dispatch_queue,
            result_queue,
            poll_wait: config.poll_wait,
        })
    }

    /// Polls for batches until the process is stopped.
    ///
    /// Workers have no shutdown protocol of their own: the coordinator
    /// deprovisions their instances when demand falls.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!("worker runtime started");

        loop {
            match self.queues.receive(&self.dispatch_queue, self.poll_wait).await {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle_batch(&message).await {
                        error!(error = %e, "batch handler failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "failed to receive from dispatch queue");
                    tokio::time::sleep(self.poll_wait).await;
                }
            }
        }
    }

    /// Processes one dispatched batch and reports its outcome.
    pub async fn handle_batch(&self, message: &QueueMessage) -> Result<(), WorkerError> {
        let Some(client_id) = message.client_id().map(str::to_string) else {
            error!("dispatched batch missing client id attribute, dropping");
            self.queues.delete(&self.dispatch_queue, message).await?;
            return Ok(());
        };

        let batch = TaskBatch::from_body(&client_id, &message.body);
        debug!(client_id = %client_id, tasks = batch.len(), "processing batch");

        let mut outcome = String::new();
        for (line, parsed) in batch.tasks() {
            let entry = match parsed {
                Ok(task) => match self.transformer.process(&client_id, &task).await {
                    Ok(key) => format!("{} {} => {}", task.operation, task.source, key),
                    Err(e) => format!("{} {} => error: {}", task.operation, task.source, e),
                },
                Err(e) => format!("invalid task line '{}': {}", line, e),
            };
            outcome.push_str(&entry);
            outcome.push('\n');
        }

        let mut attributes = std::collections::HashMap::new();
        attributes.insert(CLIENT_ID_ATTR.to_string(), client_id.clone());
        self.queues
            .send(&self.result_queue, outcome.trim_end(), attributes)
            .await?;

        self.queues.delete(&self.dispatch_queue, message).await?;
        info!(client_id = %client_id, tasks = batch.len(), "batch outcome reported");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MemoryBlobGateway, MemoryQueueGateway};

    async fn runtime() -> (Arc<MemoryQueueGateway>, WorkerRuntime) {
        let queues = Arc::new(MemoryQueueGateway::new());
        let blob = Arc::new(MemoryBlobGateway::new());
        let config = FarmConfig::default().with_poll_wait(Duration::from_millis(20));

        let runtime = WorkerRuntime::new(
            Arc::clone(&queues) as Arc<dyn QueueGateway>,
            blob as Arc<dyn BlobGateway>,
            &config,
        )
        .await
        .expect("runtime");

        (queues, runtime)
    }

    #[tokio::test]
    async fn test_one_outcome_line_per_task() {
        let (queues, runtime) = runtime().await;

        // Unfetchable URLs and a malformed line: every task still reports.
        let body = "TOTEXT bogus-url\nnot a task\nTODIGEST also-bogus";
        let message = QueueMessage::for_client(body, "client-1");
        runtime.handle_batch(&message).await.expect("handle");

        let result_queue = queues.create_queue(RESULT_QUEUE).await.expect("q");
        let result = queues
            .receive(&result_queue, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("result present");

        assert_eq!(result.client_id(), Some("client-1"));
        let lines: Vec<&str> = result.body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("TOTEXT bogus-url => error:"));
        assert!(lines[1].starts_with("invalid task line 'not a task'"));
        assert!(lines[2].starts_with("TODIGEST also-bogus => error:"));
    }

    #[tokio::test]
    async fn test_batch_without_client_id_is_dropped() {
        let (queues, runtime) = runtime().await;

        let message = QueueMessage::new("TOTEXT bogus", std::collections::HashMap::new());
        runtime.handle_batch(&message).await.expect("handle");

        assert_eq!(queues.depth(RESULT_QUEUE), 0);
    }
}
