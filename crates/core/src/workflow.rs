//! ComfyUI workflow graph handling and checkpoint reconciliation.
//!
//! A workflow in API format is a JSON object keyed by node id. Each node
//! carries a `class_type` (older exports use `class`) and an `inputs`
//! object. Only checkpoint-loader nodes are ever rewritten here.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ComfyUI node class types
// ---------------------------------------------------------------------------

/// Node class types that load a checkpoint via `ckpt_name`.
pub const CHECKPOINT_LOADER_CLASSES: &[&str] = &[
    "CheckpointLoaderSimple",
    "CheckpointLoader",
    "ImageOnlyCheckpointLoader",
    "unCLIPCheckpointLoader",
];

/// Input field holding the checkpoint filename.
pub const CKPT_NAME_INPUT: &str = "ckpt_name";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A workflow graph in ComfyUI API format.
///
/// Stored as the raw JSON object so fields this crate does not know about
/// are sent to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph(Map<String, Value>);

/// Record of one automatic checkpoint substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationNote {
    pub node_id: String,
    pub requested_name: String,
    pub substituted_name: String,
}

impl fmt::Display for ReconciliationNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {}: ckpt_name '{}' not found; using '{}'",
            self.node_id, self.requested_name, self.substituted_name
        )
    }
}

impl WorkflowGraph {
    /// Interpret a job's `workflow` value.
    ///
    /// Accepts either a JSON object or a string containing one.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let value = match value {
            Value::String(text) => serde_json::from_str::<Value>(&text)
                .map_err(|e| CoreError::Validation(format!("invalid workflow JSON string: {e}")))?,
            other => other,
        };
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::Validation(format!(
                "workflow must be a JSON object keyed by node id, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The node's class type, honouring the legacy `class` alias.
    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        let node = self.0.get(node_id)?.as_object()?;
        node.get("class_type")
            .or_else(|| node.get("class"))
            .and_then(Value::as_str)
    }

    /// A node's `inputs` object, if present.
    pub fn inputs(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.0.get(node_id)?.as_object()?.get("inputs")?.as_object()
    }

    /// Current `ckpt_name` of a node, when it is a string.
    pub fn checkpoint_name(&self, node_id: &str) -> Option<&str> {
        self.inputs(node_id)?.get(CKPT_NAME_INPUT)?.as_str()
    }

    /// Ids of all checkpoint-loader nodes, sorted for stable note order.
    pub fn checkpoint_loader_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .0
            .keys()
            .filter(|id| {
                self.class_type(id)
                    .is_some_and(|ct| CHECKPOINT_LOADER_CLASSES.contains(&ct))
                    && self.inputs(id).is_some()
            })
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Point every checkpoint loader at `checkpoint`, whatever it referenced.
    ///
    /// Returns the number of nodes touched.
    pub fn force_checkpoint(&mut self, checkpoint: &str) -> usize {
        let ids = self.checkpoint_loader_ids();
        for id in &ids {
            self.set_checkpoint(id, checkpoint);
        }
        ids.len()
    }

    /// Replace references to checkpoints missing from `available` with the
    /// lexicographically first available name.
    ///
    /// An empty `available` list leaves the graph unchanged.
    pub fn reconcile_checkpoints(&mut self, available: &[&str]) -> Vec<ReconciliationNote> {
        let Some(fallback) = available.iter().min().copied() else {
            return Vec::new();
        };

        let mut notes = Vec::new();
        for id in self.checkpoint_loader_ids() {
            let Some(requested) = self.checkpoint_name(&id) else {
                continue;
            };
            if available.contains(&requested) {
                continue;
            }
            let requested = requested.to_string();
            self.set_checkpoint(&id, fallback);
            notes.push(ReconciliationNote {
                node_id: id,
                requested_name: requested,
                substituted_name: fallback.to_string(),
            });
        }
        notes
    }

    fn set_checkpoint(&mut self, node_id: &str, checkpoint: &str) {
        if let Some(inputs) = self
            .0
            .get_mut(node_id)
            .and_then(Value::as_object_mut)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(
                CKPT_NAME_INPUT.to_string(),
                Value::String(checkpoint.to_string()),
            );
        }
    }
}

/// Outcome of preparing a graph for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointPatch {
    /// A forced checkpoint was applied to this many loader nodes.
    Forced { checkpoint: String, nodes: usize },
    /// Missing references were reconciled against the inventory.
    Reconciled(Vec<ReconciliationNote>),
}

/// Apply either the forced checkpoint (when configured) or reconciliation.
///
/// The two modes never combine; a forced checkpoint wins.
pub fn patch_checkpoints(
    graph: &mut WorkflowGraph,
    forced: Option<&str>,
    available: &[&str],
) -> CheckpointPatch {
    match forced {
        Some(checkpoint) => CheckpointPatch::Forced {
            checkpoint: checkpoint.to_string(),
            nodes: graph.force_checkpoint(checkpoint),
        },
        None => CheckpointPatch::Reconciled(graph.reconcile_checkpoints(available)),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
