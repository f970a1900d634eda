//! Per-job orchestration.
//!
//! [`JobHandler::handle`] drives one job through the sequential pipeline:
//! validate the request, prepare the output directory, sync models, check
//! the inventory, patch checkpoint references, launch the engine, wait for
//! readiness, submit and wait for output, and collect images. The engine is
//! shut down on every path once it has been launched. Every failure is
//! turned into a structured error payload; nothing here panics or exits.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use renderpod_cloud::source::RemoteSource;
use renderpod_cloud::sync::SyncError;
use renderpod_cloud::synchronizer_from_config;
use renderpod_comfyui::api::ComfyUIApi;
use renderpod_comfyui::command::{candidates_from_config, LaunchContext};
use renderpod_comfyui::model_paths::write_extra_model_paths;
#[cfg(unix)]
use renderpod_comfyui::model_paths::link_models_dir;
use renderpod_comfyui::supervisor::{LaunchOptions, ServerProcess, SupervisorError};
use renderpod_core::config::WorkerConfig;
use renderpod_core::error::CoreError;
use renderpod_core::inventory::AssetInventory;
use renderpod_core::job::{round_seconds, EncodedImage, JobRequest, JobResponse};
use renderpod_core::workflow::{patch_checkpoints, CheckpointPatch, WorkflowGraph};

use crate::collector::{collect_new_images, EmptyResultError, MAX_IMAGES};
use crate::poller::{CompletionPoller, PollError};

/// Fatal job errors, each mapped to a stable `error_kind`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("cannot prepare output directory {path}: {source}")]
    OutputDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("no checkpoints found under {model_root}/checkpoints; check the manifest and model volume")]
    NoCheckpoints { model_root: String },

    #[error("engine failed to start: {0}")]
    Startup(#[from] SupervisorError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    EmptyResult(#[from] EmptyResultError),
}

impl JobError {
    /// Name reported as `error_kind` in the response payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::OutputDirectory { .. } => "OutputDirectoryError",
            Self::Sync(_) => "CacheFetchError",
            Self::NoCheckpoints { .. } => "ModelInventoryError",
            Self::Startup(_) => "ServerStartupError",
            Self::Poll(PollError::Submission(_)) => "SubmissionError",
            Self::Poll(PollError::Timeout { .. }) => "CompletionTimeoutError",
            Self::EmptyResult(_) => "EmptyResultError",
        }
    }
}

/// What a successful run produced.
struct JobOutcome {
    images: Vec<EncodedImage>,
    notes: Vec<String>,
}

/// Runs jobs against one worker configuration.
///
/// Jobs must be dispatched one at a time: the output directory, model root
/// and engine port are shared by every run.
pub struct JobHandler {
    config: WorkerConfig,
    source: Option<Arc<dyn RemoteSource>>,
}

impl JobHandler {
    pub fn new(config: WorkerConfig, source: Option<Arc<dyn RemoteSource>>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one job to completion and build its response.
    pub async fn handle(&self, request: &JobRequest) -> JobResponse {
        let started = Instant::now();
        let job_id = request.id.as_deref().unwrap_or("-");
        tracing::info!(job_id, "Job started");

        match self.run(request).await {
            Ok(outcome) => {
                let execution_time_seconds = round_seconds(started.elapsed().as_secs_f64());
                tracing::info!(
                    job_id,
                    images = outcome.images.len(),
                    execution_time_seconds,
                    "Job finished",
                );
                JobResponse::Ok {
                    images: outcome.images,
                    execution_time_seconds,
                    notes: outcome.notes,
                }
            }
            Err(e) => {
                tracing::error!(job_id, error_kind = e.kind(), error = %e, "Job failed");
                JobResponse::error(e.kind(), e.to_string())
            }
        }
    }

    async fn run(&self, request: &JobRequest) -> Result<JobOutcome, JobError> {
        let config = &self.config;
        let mut graph = request.workflow()?;

        prepare_output_dir(&config.output_root).await?;

        let report = synchronizer_from_config(config, self.source.clone())
            .sync()
            .await?;
        if !report.failures.is_empty() {
            tracing::warn!(
                failed = report.failures.len(),
                "Continuing with models missing from the cache",
            );
        }

        let inventory = AssetInventory::scan(&config.model_root);
        tracing::info!(summary = %inventory.summary(), "Model inventory");
        let checkpoints = inventory.checkpoints();
        if checkpoints.is_empty() {
            return Err(JobError::NoCheckpoints {
                model_root: config.model_root.display().to_string(),
            });
        }

        let notes = match patch_checkpoints(
            &mut graph,
            config.forced_checkpoint.as_deref(),
            &checkpoints,
        ) {
            CheckpointPatch::Forced { checkpoint, nodes } => {
                tracing::info!(checkpoint = %checkpoint, nodes, "Forcing checkpoint on loader nodes");
                Vec::new()
            }
            CheckpointPatch::Reconciled(notes) => {
                for note in &notes {
                    tracing::warn!(
                        node_id = %note.node_id,
                        requested = %note.requested_name,
                        substituted = %note.substituted_name,
                        "Checkpoint reconciled",
                    );
                }
                notes.iter().map(ToString::to_string).collect()
            }
        };

        if config.engine.write_model_paths {
            match write_extra_model_paths(&config.engine.root, &config.model_root).await {
                Ok(path) => tracing::debug!(path = %path.display(), "Wrote engine model paths"),
                Err(e) => tracing::warn!(
                    engine_root = %config.engine.root.display(),
                    error = %e,
                    "Could not write engine model paths",
                ),
            }
            #[cfg(unix)]
            match link_models_dir(&config.engine.root, &config.model_root).await {
                Ok(outcome) => tracing::debug!(?outcome, "Engine models directory"),
                Err(e) => tracing::warn!(
                    engine_root = %config.engine.root.display(),
                    error = %e,
                    "Could not link engine models directory",
                ),
            }
        }

        let options = LaunchOptions {
            launch_grace: config.timeouts.launch_grace,
            terminate_grace: config.timeouts.terminate_grace,
        };
        let mut server = ServerProcess::launch(
            &candidates_from_config(config),
            &LaunchContext::from_config(config),
            options,
        )
        .await?;

        let result = self.drive_engine(&mut server, &graph).await;
        server.shutdown().await;

        Ok(JobOutcome {
            images: result?,
            notes,
        })
    }

    /// Everything that needs the engine running.
    async fn drive_engine(
        &self,
        server: &mut ServerProcess,
        graph: &WorkflowGraph,
    ) -> Result<Vec<EncodedImage>, JobError> {
        let timeouts = &self.config.timeouts;
        server
            .wait_until_ready(timeouts.readiness, timeouts.poll_interval)
            .await?;

        if !timeouts.settle_delay.is_zero() {
            tokio::time::sleep(timeouts.settle_delay).await;
        }

        let poller = CompletionPoller::new(
            ComfyUIApi::new(self.config.engine_api_url()),
            self.config.output_root.clone(),
            timeouts.poll_interval,
            timeouts.completion,
        );
        let completion = poller.submit_and_wait(graph).await?;

        Ok(collect_new_images(self.config.output_root.clone(), completion.baseline, MAX_IMAGES).await?)
    }
}

/// Create `dir` and remove everything inside it.
async fn prepare_output_dir(dir: &Path) -> Result<(), JobError> {
    let wrap = |source| JobError::OutputDirectory {
        path: dir.display().to_string(),
        source,
    };

    tokio::fs::create_dir_all(dir).await.map_err(wrap)?;
    let mut entries = tokio::fs::read_dir(dir).await.map_err(wrap)?;
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await.map_err(wrap)? {
        let path = entry.path();
        let is_dir = entry.file_type().await.map_err(wrap)?.is_dir();
        if is_dir {
            tokio::fs::remove_dir_all(&path).await.map_err(wrap)?;
        } else {
            tokio::fs::remove_file(&path).await.map_err(wrap)?;
        }
        removed += 1;
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "Cleared output directory");
    }
    Ok(())
}
