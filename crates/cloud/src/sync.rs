//! Manifest-driven model cache synchronisation.
//!
//! [`CacheSynchronizer::sync`] walks the manifest in order and makes sure
//! each listed asset exists under the model root. Existing files are
//! cache hits and never touch the network, so repeated runs against an
//! unchanged manifest are free. A failed fetch is logged and skipped
//! unless strict mode is enabled.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use renderpod_core::error::CoreError;
use renderpod_core::manifest::{load_manifest, ManifestEntry};

use crate::source::{FetchError, RemoteSource};

/// Suffix of the temporary file a fetch writes before the final rename.
const PARTIAL_SUFFIX: &str = ".partial";

/// One asset that could not be fetched.
#[derive(Debug, thiserror::Error)]
#[error("failed to fetch {uri} (manifest line {line_no}): {source}")]
pub struct CacheFetchError {
    pub line_no: usize,
    /// Remote object key (`prefix + manifest line`).
    pub key: String,
    pub uri: String,
    #[source]
    pub source: FetchError,
}

/// Fatal synchronisation errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The manifest exists but could not be read.
    #[error("cannot read manifest: {0}")]
    Manifest(#[from] CoreError),

    /// The model root could not be created.
    #[error("cannot create model root {path}: {source}")]
    ModelRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A fetch failed while strict mode was enabled.
    #[error("strict sync aborted: {0}")]
    Strict(CacheFetchError),
}

/// Outcome of a synchronisation pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Entries already present locally.
    pub cache_hits: usize,
    /// Entries fetched during this pass.
    pub fetched: usize,
    /// Entries that failed and were skipped.
    pub failures: Vec<CacheFetchError>,
    /// True when no remote source or no manifest was available.
    pub skipped: bool,
}

/// Ensures manifest-listed assets exist under the model root.
pub struct CacheSynchronizer {
    source: Option<Arc<dyn RemoteSource>>,
    prefix: String,
    model_root: PathBuf,
    manifest_path: PathBuf,
    strict: bool,
}

impl CacheSynchronizer {
    /// Create a synchronizer.
    ///
    /// * `source` - remote store, or `None` to make [`sync`](Self::sync) a no-op.
    /// * `prefix` - prepended to each manifest line to form the object key.
    pub fn new(
        source: Option<Arc<dyn RemoteSource>>,
        prefix: impl Into<String>,
        model_root: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            prefix: prefix.into(),
            model_root: model_root.into(),
            manifest_path: manifest_path.into(),
            strict: false,
        }
    }

    /// Abort on the first failed fetch instead of skipping it.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Run one synchronisation pass.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let Some(source) = self.source.as_deref() else {
            tracing::info!("No remote model source configured, skipping model sync");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };

        let Some(entries) = load_manifest(&self.manifest_path)? else {
            tracing::info!(
                manifest = %self.manifest_path.display(),
                "No model manifest, skipping model sync",
            );
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };

        tokio::fs::create_dir_all(&self.model_root)
            .await
            .map_err(|source| SyncError::ModelRoot {
                path: self.model_root.display().to_string(),
                source,
            })?;

        let mut report = SyncReport::default();
        for entry in &entries {
            match self.sync_entry(source, entry).await {
                Ok(EntryOutcome::CacheHit) => report.cache_hits += 1,
                Ok(EntryOutcome::Fetched) => report.fetched += 1,
                Err(err) => {
                    tracing::error!(
                        key = %err.key,
                        uri = %err.uri,
                        rc = ?err.source.return_code(),
                        error = %err.source,
                        "Model fetch failed",
                    );
                    if self.strict {
                        return Err(SyncError::Strict(err));
                    }
                    report.failures.push(err);
                }
            }
        }

        tracing::info!(
            entries = entries.len(),
            cache_hits = report.cache_hits,
            fetched = report.fetched,
            failed = report.failures.len(),
            "Model sync complete",
        );
        Ok(report)
    }

    // ---- private helpers ----

    async fn sync_entry(
        &self,
        source: &dyn RemoteSource,
        entry: &ManifestEntry,
    ) -> Result<EntryOutcome, CacheFetchError> {
        let key = entry.remote_key(&self.prefix);
        let uri = source.uri(&key);
        let fail = |source: FetchError| CacheFetchError {
            line_no: entry.line_no,
            key: key.clone(),
            uri: uri.clone(),
            source,
        };

        let dest = entry
            .destination(&self.model_root)
            .map_err(|e| fail(FetchError::InvalidEntry(e.to_string())))?;

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tracing::debug!(dest = %dest.display(), "Model cache hit");
            return Ok(EntryOutcome::CacheHit);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fail(FetchError::Io(e)))?;
        }

        let partial = partial_path(&dest);
        tracing::info!(uri = %uri, dest = %dest.display(), "Fetching model");

        let fetched = match source.fetch(&key, &partial).await {
            Ok(()) => tokio::fs::rename(&partial, &dest)
                .await
                .map_err(FetchError::Io),
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(fail(e));
        }

        Ok(EntryOutcome::Fetched)
    }
}

enum EntryOutcome {
    CacheHit,
    Fetched,
}

/// `dest` with [`PARTIAL_SUFFIX`] appended to the filename.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}
