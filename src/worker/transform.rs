//! The document transformer: fetch a source document, apply one
//! transform, upload the derived artifact.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::gateway::{BlobGateway, GatewayError, OUTPUT_PREFIX};
use crate::task::{OperationKind, Task};

/// Errors that can occur while processing a single task.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The HTTP client could not be constructed.
    #[error("http client construction failed: {0}")]
    HttpClient(String),

    /// The source URL yields no usable artifact name.
    #[error("invalid source url '{0}'")]
    InvalidSource(String),

    /// Downloading the source document failed.
    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// Uploading the derived artifact failed.
    #[error("blob gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Stateless per-task transformer.
pub struct DocumentTransformer {
    http: reqwest::Client,
    blob: Arc<dyn BlobGateway>,
}

impl DocumentTransformer {
    /// Creates a transformer with the given document-fetch timeout.
    pub fn new(blob: Arc<dyn BlobGateway>, http_timeout: Duration) -> Result<Self, TransformError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| TransformError::HttpClient(e.to_string()))?;

        Ok(Self { http, blob })
    }

    /// Processes one task: fetch, transform, upload.
    ///
    /// Returns the blob key of the derived artifact.
    pub async fn process(&self, client_id: &str, task: &Task) -> Result<String, TransformError> {
        let name = task
            .output_name()
            .ok_or_else(|| TransformError::InvalidSource(task.source.clone()))?;

        let document = self.fetch(&task.source).await?;
        let derived = match task.operation {
            OperationKind::ToText => to_text(&document),
            OperationKind::ToHtml => to_html(&document),
            OperationKind::ToDigest => to_digest(&document),
        };

        let key = format!("{OUTPUT_PREFIX}{client_id}/{name}");
        self.blob.put(&key, &derived).await?;

        debug!(
            operation = %task.operation,
            source = %task.source,
            key = %key,
            "derived artifact uploaded"
        );
        Ok(key)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransformError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TransformError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TransformError::Fetch {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| TransformError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(bytes.to_vec())
    }
}

/// Lossy text extraction with normalized line endings.
fn to_text(document: &[u8]) -> String {
    String::from_utf8_lossy(document).replace("\r\n", "\n")
}

/// Wraps the document text in a minimal escaped HTML page.
fn to_html(document: &[u8]) -> String {
    let text = to_text(document);
    format!(
        "<!DOCTYPE html><html><head><meta charset='UTF-8'>\
         <style>pre {{ white-space: pre-wrap; word-wrap: break-word; }}</style>\
         </head><body><pre>{}</pre></body></html>",
        escape_html(&text)
    )
}

/// SHA-256 hex digest of the raw document bytes.
fn to_digest(document: &[u8]) -> String {
    hex::encode(Sha256::digest(document))
}

/// Escapes text for embedding in HTML.
pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
