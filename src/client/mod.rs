//! Submission client: uploads a task list, waits for the completed
//! report and renders it to a local HTML file.
//!
//! The client owns no orchestration state. It bootstraps the coordinator
//! instance if none is running, sends exactly one submission message,
//! blocks on its deterministic reply queue with a bounded poll, and
//! optionally sends the shutdown sentinel once its report arrived.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::FarmConfig;
use crate::gateway::{
    reply_queue_name, submission_key, BlobGateway, ComputeGateway, GatewayError,
    InstanceStateFilter, QueueGateway, COORDINATOR_ROLE, ROLE_TAG, SHUTDOWN_SENTINEL,
    SUBMISSION_PREFIX, SUBMISSION_QUEUE,
};
use crate::worker::transform::escape_html;

/// Errors that can occur in the submission client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A gateway call failed.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Reading the task list or writing the report failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One-shot submission handle with a generated client identity.
pub struct SubmitClient {
    queues: Arc<dyn QueueGateway>,
    blob: Arc<dyn BlobGateway>,
    compute: Arc<dyn ComputeGateway>,
    config: FarmConfig,
    client_id: String,
}

impl SubmitClient {
    pub fn new(
        queues: Arc<dyn QueueGateway>,
        blob: Arc<dyn BlobGateway>,
        compute: Arc<dyn ComputeGateway>,
        config: FarmConfig,
    ) -> Self {
        Self {
            queues,
            blob,
            compute,
            config,
            client_id: Uuid::new_v4().to_string(),
        }
    }

    /// This client's generated identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Submits a task list and blocks until the completed report is
    /// available, returning the report text.
    ///
    /// With `terminate_after`, the shutdown sentinel is sent once the
    /// report has been fetched.
    pub async fn submit(
        &self,
        task_list: &str,
        terminate_after: bool,
    ) -> Result<String, ClientError> {
        info!(client_id = %self.client_id, "submitting task list");

        self.ensure_coordinator().await?;

        self.blob.ensure_prefix(SUBMISSION_PREFIX).await?;
        let key = submission_key(&self.client_id);
        self.blob.put(&key, task_list).await?;

        let submissions = self.queues.create_queue(SUBMISSION_QUEUE).await?;
        let mut attributes = HashMap::new();
        attributes.insert(
            crate::gateway::CLIENT_ID_ATTR.to_string(),
            self.client_id.clone(),
        );
        self.queues.send(&submissions, &key, attributes).await?;

        let report_key = self.wait_for_completion().await?;
        info!(client_id = %self.client_id, report = %report_key, "completion notice received");
        let report = self.blob.get(&report_key).await?;

        if terminate_after {
            info!("sending shutdown sentinel");
            self.queues
                .send(&submissions, SHUTDOWN_SENTINEL, HashMap::new())
                .await?;
        }

        Ok(report)
    }

    /// Reads a task list from `input`, submits it, and writes the
    /// rendered HTML report to `output`.
    pub async fn submit_file(
        &self,
        input: &Path,
        output: &Path,
        terminate_after: bool,
    ) -> Result<(), ClientError> {
        let task_list = tokio::fs::read_to_string(input).await?;
        let report = self.submit(&task_list, terminate_after).await?;
        tokio::fs::write(output, self.render_report(&report)).await?;
        info!(output = %output.display(), "report written");
        Ok(())
    }

    /// Starts a coordinator instance when none is running.
    async fn ensure_coordinator(&self) -> Result<(), ClientError> {
        let running = self
            .compute
            .list_instances_by_tag(ROLE_TAG, COORDINATOR_ROLE, InstanceStateFilter::Running)
            .await?;

        if running.is_empty() {
            info!("no coordinator instance running, starting one");
            let mut tags = HashMap::new();
            tags.insert(ROLE_TAG.to_string(), COORDINATOR_ROLE.to_string());
            let instance = self
                .compute
                .start_instance(&self.config.coordinator_image, &tags)
                .await?;
            info!(instance = %instance, "coordinator instance started");
        } else {
            debug!(instances = running.len(), "coordinator already running");
        }

        Ok(())
    }

    /// Polls the reply queue until the completion notice arrives, then
    /// deletes the consumed notice and the queue itself.
    async fn wait_for_completion(&self) -> Result<String, ClientError> {
        let reply = self
            .queues
            .create_queue(&reply_queue_name(&self.client_id))
            .await?;
        info!(client_id = %self.client_id, "waiting for completion notice");

        loop {
            if let Some(message) = self.queues.receive(&reply, self.config.poll_wait).await? {
                self.queues.delete(&reply, &message).await?;
                self.queues.delete_queue(&reply).await?;
                return Ok(message.body);
            }
            debug!(client_id = %self.client_id, "still waiting for completion");
        }
    }

    /// Renders the raw report into a standalone HTML page, one list item
    /// per outcome line.
    pub fn render_report(&self, report: &str) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html><html lang='en'><head><meta charset='UTF-8'>");
        html.push_str("<title>Task Farm Report</title><style>");
        html.push_str("body { font-family: sans-serif; margin: 20px; }");
        html.push_str("li { margin: 5px 0; padding: 8px; border: 1px solid #ddd; }");
        html.push_str("</style></head><body>");
        html.push_str(&format!(
            "<h1>Task Farm Report</h1><p>Client {} &mdash; {}</p><ol>",
            escape_html(&self.client_id),
            Utc::now().to_rfc3339()
        ));

        for line in report.lines().filter(|line| !line.trim().is_empty()) {
            html.push_str(&format!("<li>{}</li>", escape_html(line)));
        }

        html.push_str("</ol></body></html>");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        completed_key, MemoryBlobGateway, MemoryComputeGateway, MemoryQueueGateway,
    };
    use std::time::Duration;

    fn client() -> (
        Arc<MemoryQueueGateway>,
        Arc<MemoryBlobGateway>,
        Arc<MemoryComputeGateway>,
        SubmitClient,
    ) {
        let queues = Arc::new(MemoryQueueGateway::new());
        let blob = Arc::new(MemoryBlobGateway::new());
        let compute = Arc::new(MemoryComputeGateway::new());
        let config = FarmConfig::default().with_poll_wait(Duration::from_millis(20));

        let client = SubmitClient::new(
            Arc::clone(&queues) as Arc<dyn QueueGateway>,
            Arc::clone(&blob) as Arc<dyn BlobGateway>,
            Arc::clone(&compute) as Arc<dyn ComputeGateway>,
            config,
        );

        (queues, blob, compute, client)
    }

    #[tokio::test]
    async fn test_submit_uploads_and_waits_for_notice() {
        let (queues, blob, compute, client) = client();
        let client_id = client.client_id().to_string();

        // Simulate the coordinator answering the submission.
        let answer = {
            let queues = Arc::clone(&queues);
            let blob = Arc::clone(&blob);
            let client_id = client_id.clone();
            tokio::spawn(async move {
                let key = completed_key(&client_id);
                blob.put(&key, "TOTEXT https://a/x.pdf => customer-files/x.txt")
                    .await
                    .expect("put");
                let reply = queues
                    .create_queue(&reply_queue_name(&client_id))
                    .await
                    .expect("q");
                queues
                    .send(&reply, &key, HashMap::new())
                    .await
                    .expect("send");
            })
        };

        let report = client
            .submit("TOTEXT https://a/x.pdf", false)
            .await
            .expect("submit");
        answer.await.expect("answer task");

        assert!(report.contains("customer-files/x.txt"));

        // Task list uploaded under the reserved key, coordinator started.
        assert!(blob
            .get(&submission_key(&client_id))
            .await
            .expect("task list stored")
            .contains("TOTEXT"));
        assert_eq!(compute.start_calls(), 1);

        // One submission message, tagged with the client id.
        let submissions = queues.create_queue(SUBMISSION_QUEUE).await.expect("q");
        let message = queues
            .receive(&submissions, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("present");
        assert_eq!(message.client_id(), Some(client_id.as_str()));
        assert_eq!(message.body, submission_key(&client_id));
    }

    #[tokio::test]
    async fn test_terminate_after_sends_sentinel() {
        let (queues, blob, _, client) = client();
        let client_id = client.client_id().to_string();

        let key = completed_key(&client_id);
        blob.put(&key, "outcome").await.expect("put");
        let reply = queues
            .create_queue(&reply_queue_name(&client_id))
            .await
            .expect("q");
        queues.send(&reply, &key, HashMap::new()).await.expect("send");

        client.submit("TOTEXT https://a/x.pdf", true).await.expect("submit");

        let submissions = queues.create_queue(SUBMISSION_QUEUE).await.expect("q");
        let first = queues
            .receive(&submissions, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("submission message");
        assert_eq!(first.body, submission_key(&client_id));

        let second = queues
            .receive(&submissions, Duration::from_millis(50))
            .await
            .expect("receive")
            .expect("sentinel message");
        assert_eq!(second.body, SHUTDOWN_SENTINEL);
    }

    #[tokio::test]
    async fn test_coordinator_not_restarted_when_running() {
        let (_, _, compute, client) = client();

        let mut tags = HashMap::new();
        tags.insert(ROLE_TAG.to_string(), COORDINATOR_ROLE.to_string());
        compute
            .start_instance("coordinator:test", &tags)
            .await
            .expect("start");

        client.ensure_coordinator().await.expect("ensure");
        assert_eq!(compute.start_calls(), 1);
    }

    #[test]
    fn test_render_report_escapes_lines() {
        let (_, _, _, client) = client();
        let html = client.render_report("TOTEXT <a> => ok\n\nsecond line");

        assert!(html.contains("<li>TOTEXT &lt;a&gt; =&gt; ok</li>"));
        assert!(html.contains("<li>second line</li>"));
        assert_eq!(html.matches("<li>").count(), 2);
    }
}
