//! Worker result collection and per-client completion detection.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::gateway::{
    completed_key, reply_queue_name, BlobGateway, GatewayError, QueueGateway, QueueId,
    QueueMessage, CLIENT_ID_ATTR,
};
use crate::metrics;

use super::autoscaler::AutoscalingController;
use super::session::{DemandCounter, ReplyQueueRegistry, SessionMap};

/// Errors that can occur while handling a worker result.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// A gateway call failed; the result message stays unacknowledged and
    /// will be redelivered.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Consumes worker results, accumulates per-client output and publishes
/// the final report when a client's last batch resolves.
///
/// Idempotent only across results for *different* batches: a duplicate
/// delivery of the same batch result double-counts. At-least-once
/// delivery without batch-level deduplication makes that a known
/// limitation; the negative pending count it eventually produces is
/// logged as an anomaly rather than masked.
pub struct ResultAggregator {
    queues: Arc<dyn QueueGateway>,
    blob: Arc<dyn BlobGateway>,
    sessions: Arc<SessionMap>,
    demand: Arc<DemandCounter>,
    autoscaler: Arc<AutoscalingController>,
    reply_queues: Arc<ReplyQueueRegistry>,
    result_queue: QueueId,
}

impl ResultAggregator {
    pub fn new(
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        sessions: Arc<SessionMap>,
        demand: Arc<DemandCounter>,
        autoscaler: Arc<AutoscalingController>,
        reply_queues: Arc<ReplyQueueRegistry>,
        result_queue: QueueId,
    ) -> Self {
        Self {
            queues,
            blob,
            sessions,
            demand,
            autoscaler,
            reply_queues,
            result_queue,
        }
    }

    /// Handles one worker-result message.
    pub async fn handle_result(&self, message: QueueMessage) -> Result<(), AggregateError> {
        let Some(client_id) = message.client_id().map(str::to_string) else {
            error!("worker result missing client id attribute, dropping");
            self.queues.delete(&self.result_queue, &message).await?;
            return Ok(());
        };

        // Created on demand: a result may overtake the submission path's
        // bookkeeping under reordered delivery.
        let session = self.sessions.get_or_create(&client_id);

        {
            let mut guard = session.lock().await;
            guard.append_result(&message.body);
            guard.pending_batches -= 1;

            debug!(
                client_id = %client_id,
                pending = guard.pending_batches,
                "collected batch result"
            );

            if guard.pending_batches == 0 {
                let report_key = completed_key(&client_id);
                self.blob.put(&report_key, &guard.buffer).await?;

                let reply_queue = match guard.reply_queue.clone() {
                    Some(queue) => queue,
                    None => {
                        let queue = self
                            .queues
                            .create_queue(&reply_queue_name(&client_id))
                            .await?;
                        guard.reply_queue = Some(queue.clone());
                        self.reply_queues.record(queue.clone());
                        queue
                    }
                };

                let mut attributes = HashMap::new();
                attributes.insert(CLIENT_ID_ATTR.to_string(), client_id.clone());
                self.queues
                    .send(&reply_queue, &report_key, attributes)
                    .await?;

                drop(guard);
                self.sessions.remove(&client_id);
                metrics::record_report_published();
                info!(client_id = %client_id, report = %report_key, "client work complete, report published");
            } else if guard.pending_batches < 0 {
                error!(
                    client_id = %client_id,
                    pending = guard.pending_batches,
                    "pending batch count went negative; duplicate or reordered result delivery"
                );
            }
        }

        let demand = self.demand.decrement();
        metrics::set_demand(demand);
        metrics::record_result_collected();

        self.queues.delete(&self.result_queue, &message).await?;
        self.autoscaler.reconcile().await;

        Ok(())
    }
}
