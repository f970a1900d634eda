//! Workflow submission and completion detection.
//!
//! The engine gives no "done" notification, so completion is inferred from
//! the output directory: a baseline snapshot is taken immediately before
//! the prompt is sent and the job is complete once an image file outside
//! that baseline appears.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use renderpod_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use renderpod_core::images::is_image_path;
use renderpod_core::workflow::WorkflowGraph;
use walkdir::WalkDir;

/// Image files present in the output directory at one point in time.
pub type ImageSnapshot = HashSet<PathBuf>;

/// Recursively list image files under `dir`.
///
/// A missing or unreadable directory yields an empty snapshot.
pub fn snapshot_images(dir: &Path) -> ImageSnapshot {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_image_path(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// [`snapshot_images`] on the blocking thread pool.
pub async fn snapshot_images_blocking(dir: PathBuf) -> ImageSnapshot {
    let task_dir = dir.clone();
    match tokio::task::spawn_blocking(move || snapshot_images(&task_dir)).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "Output snapshot task failed");
            ImageSnapshot::new()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The engine rejected the prompt or could not be reached.
    #[error("workflow submission failed: {0}")]
    Submission(#[from] ComfyUIApiError),

    #[error("no new image appeared in {dir} within {}s", .timeout.as_secs_f64())]
    Timeout { dir: String, timeout: Duration },
}

/// Result of a successful submit-and-wait.
#[derive(Debug)]
pub struct Completion {
    /// Snapshot taken right before submission.
    pub baseline: ImageSnapshot,
    /// First new image observed.
    pub first_new: PathBuf,
    pub prompt_id: Option<String>,
    /// Time from submission to completion.
    pub elapsed: Duration,
}

/// Submits a workflow and waits for new output.
pub struct CompletionPoller {
    api: ComfyUIApi,
    output_dir: PathBuf,
    interval: Duration,
    timeout: Duration,
}

impl CompletionPoller {
    pub fn new(api: ComfyUIApi, output_dir: PathBuf, interval: Duration, timeout: Duration) -> Self {
        Self {
            api,
            output_dir,
            interval,
            timeout,
        }
    }

    /// Take the baseline, submit `graph`, then wait for a new image.
    pub async fn submit_and_wait(&self, graph: &WorkflowGraph) -> Result<Completion, PollError> {
        let baseline = snapshot_images_blocking(self.output_dir.clone()).await;
        tracing::debug!(baseline = baseline.len(), "Output baseline taken");

        let submitted = self.api.submit_workflow(graph).await?;
        tracing::info!(
            prompt_id = ?submitted.prompt_id,
            queue_number = ?submitted.number,
            nodes = graph.len(),
            "Workflow submitted",
        );

        let start = Instant::now();
        let first_new = self.wait_for_new_image(&baseline).await?;
        let elapsed = start.elapsed();
        tracing::info!(
            file = %first_new.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "New output detected",
        );

        Ok(Completion {
            baseline,
            first_new,
            prompt_id: submitted.prompt_id,
            elapsed,
        })
    }

    /// Poll until an image not in `baseline` exists, or the deadline passes.
    pub async fn wait_for_new_image(&self, baseline: &ImageSnapshot) -> Result<PathBuf, PollError> {
        let start = Instant::now();
        loop {
            let current = snapshot_images_blocking(self.output_dir.clone()).await;
            if let Some(path) = current.difference(baseline).min() {
                return Ok(path.clone());
            }

            let remaining = self.timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(PollError::Timeout {
                    dir: self.output_dir.display().to_string(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}
