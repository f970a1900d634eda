//! Remote model storage and local cache synchronisation.
//!
//! Defines the [`source::RemoteSource`] trait with S3 SDK and CLI
//! backends, and the manifest-driven [`sync::CacheSynchronizer`].

use std::sync::Arc;

use renderpod_core::config::{FetchBackend, WorkerConfig};

pub mod s3;
pub mod source;
pub mod sync;

use s3::{AwsCliSource, S3Source};
use source::RemoteSource;
use sync::CacheSynchronizer;

/// Build the configured remote source, or `None` when no bucket is set.
pub async fn remote_source_from_config(config: &WorkerConfig) -> Option<Arc<dyn RemoteSource>> {
    let remote = config.remote.as_ref()?;
    let source: Arc<dyn RemoteSource> = match config.fetch_backend {
        FetchBackend::Sdk => Arc::new(S3Source::connect(remote.bucket.clone(), &remote.region).await),
        FetchBackend::Cli => Arc::new(AwsCliSource::new(
            remote.bucket.clone(),
            remote.region.clone(),
        )),
    };
    Some(source)
}

/// Build a synchronizer wired to `source` using the config's paths.
pub fn synchronizer_from_config(
    config: &WorkerConfig,
    source: Option<Arc<dyn RemoteSource>>,
) -> CacheSynchronizer {
    let prefix = config
        .remote
        .as_ref()
        .map(|r| r.prefix.clone())
        .unwrap_or_default();
    CacheSynchronizer::new(
        source,
        prefix,
        config.model_root.clone(),
        config.manifest_path.clone(),
    )
    .strict(config.strict_sync)
}
