//! Client submission handling and batch dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::gateway::{
    BlobGateway, GatewayError, QueueGateway, QueueId, QueueMessage, CLIENT_ID_ATTR,
    SHUTDOWN_SENTINEL, SUBMISSION_PREFIX,
};
use crate::metrics;
use crate::task::TaskBatch;

use super::autoscaler::AutoscalingController;
use super::lifecycle::Lifecycle;
use super::session::{DemandCounter, SessionMap};

/// Errors that can occur while handling a submission.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A gateway call failed; the submission message stays unacknowledged
    /// and will be redelivered.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Consumes client submissions, splits task lists into batches and
/// publishes them to the work queue.
///
/// Per dispatched batch, three effects form one logical unit performed
/// under the owning session's lock: the queue publish, the session's
/// pending increment, and the global demand increment.
pub struct TaskDispatcher {
    queues: Arc<dyn QueueGateway>,
    blob: Arc<dyn BlobGateway>,
    sessions: Arc<SessionMap>,
    demand: Arc<DemandCounter>,
    lifecycle: Arc<Lifecycle>,
    autoscaler: Arc<AutoscalingController>,
    drain_signal: Arc<Notify>,
    submission_queue: QueueId,
    dispatch_queue: QueueId,
    tasks_per_worker: usize,
}

impl TaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        sessions: Arc<SessionMap>,
        demand: Arc<DemandCounter>,
        lifecycle: Arc<Lifecycle>,
        autoscaler: Arc<AutoscalingController>,
        drain_signal: Arc<Notify>,
        submission_queue: QueueId,
        dispatch_queue: QueueId,
        tasks_per_worker: usize,
    ) -> Self {
        Self {
            queues,
            blob,
            sessions,
            demand,
            lifecycle,
            autoscaler,
            drain_signal,
            submission_queue,
            dispatch_queue,
            tasks_per_worker,
        }
    }

    /// Handles one client-submission message.
    ///
    /// The body is either the shutdown sentinel or a reference to a
    /// stored task list. Protocol violations are logged and the message
    /// acknowledged so a poisoned submission cannot loop forever.
    pub async fn handle_submission(&self, message: QueueMessage) -> Result<(), DispatchError> {
        if message.body == SHUTDOWN_SENTINEL {
            if self.lifecycle.begin_drain() {
                info!("shutdown sentinel received, entering drain");
                self.drain_signal.notify_one();
            } else {
                debug!("shutdown sentinel already observed, ignoring duplicate");
            }
            self.queues.delete(&self.submission_queue, &message).await?;
            return Ok(());
        }

        let Some(client_id) = message.client_id().map(str::to_string) else {
            error!(body = %message.body, "submission missing client id attribute, dropping");
            self.queues.delete(&self.submission_queue, &message).await?;
            return Ok(());
        };

        if !message.body.starts_with(SUBMISSION_PREFIX) || !message.body.ends_with(".TASK") {
            error!(
                client_id = %client_id,
                body = %message.body,
                "submission body is not a task-list reference, dropping"
            );
            self.queues.delete(&self.submission_queue, &message).await?;
            return Ok(());
        }

        let task_list = self.blob.get(&message.body).await?;
        let batches = TaskBatch::partition(&client_id, &task_list, self.tasks_per_worker);

        if batches.is_empty() {
            warn!(client_id = %client_id, "submission contained no tasks");
            self.queues.delete(&self.submission_queue, &message).await?;
            return Ok(());
        }

        let session = self.sessions.get_or_create(&client_id);
        let batch_count = batches.len();

        for batch in batches {
            let mut guard = session.lock().await;

            let mut attributes = HashMap::new();
            attributes.insert(CLIENT_ID_ATTR.to_string(), client_id.clone());
            self.queues
                .send(&self.dispatch_queue, &batch.body(), attributes)
                .await?;

            guard.pending_batches += 1;
            let demand = self.demand.increment();
            metrics::set_demand(demand);

            debug!(
                client_id = %client_id,
                batch_size = batch.len(),
                pending = guard.pending_batches,
                demand,
                "dispatched batch"
            );
        }

        metrics::record_batches_dispatched(batch_count);
        info!(client_id = %client_id, batches = batch_count, "submission dispatched");

        self.queues.delete(&self.submission_queue, &message).await?;
        self.autoscaler.reconcile().await;

        Ok(())
    }
}
