//! REST client for the local ComfyUI prompt endpoint.
//!
//! Wraps `POST /prompt` using [`reqwest`]. Only an HTTP 200 counts as an
//! accepted submission.

use std::time::Duration;

use renderpod_core::workflow::WorkflowGraph;
use serde::Deserialize;

/// Per-request timeout for prompt submission.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum characters of an error response body kept in [`ComfyUIApiError`].
const MAX_ERROR_BODY_CHARS: usize = 500;

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
///
/// Fields are optional because older engine builds return less.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI answered with something other than 200.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },
}

impl ComfyUIApiError {
    /// HTTP status of a rejected submission, if the engine answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with body `{"prompt": <workflow>}`. A non-JSON
    /// success body is tolerated and yields an empty [`SubmitResponse`].
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowGraph,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({ "prompt": workflow });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        if status != reqwest::StatusCode::OK {
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(serde_json::from_str(&text).unwrap_or_default())
    }
}
