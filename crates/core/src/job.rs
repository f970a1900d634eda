//! Job request and response wire types.
//!
//! The hosting runtime delivers `{"input": {"workflow": ...}}` and expects
//! either an `ok` payload with base64 images or an `error` payload naming
//! the failure kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::WorkflowGraph;

/// A job as delivered by the hosting runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Runtime-assigned job id, used only for log correlation.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    /// Workflow object, or a string containing workflow JSON.
    #[serde(default)]
    pub workflow: Option<Value>,
}

impl JobRequest {
    /// Extract and parse the workflow graph.
    pub fn workflow(&self) -> Result<WorkflowGraph, CoreError> {
        let value = self
            .input
            .workflow
            .clone()
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                CoreError::Validation("no workflow provided (expected input.workflow)".into())
            })?;
        WorkflowGraph::from_value(value)
    }
}

/// One collected image in transport-safe form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub filename: String,
    /// Standard-alphabet base64 of the file bytes.
    pub content_b64: String,
}

/// Result payload returned to the hosting runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResponse {
    Ok {
        images: Vec<EncodedImage>,
        execution_time_seconds: f64,
        /// Checkpoint substitutions; always present, empty when none were made.
        notes: Vec<String>,
    },
    Error {
        error_kind: String,
        message: String,
    },
}

impl JobResponse {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error_kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Round wall time to two decimals for the response payload.
pub fn round_seconds(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}
