//! Boot-time diagnostics.

use renderpod_core::config::WorkerConfig;
use renderpod_core::inventory::{AssetInventory, MODEL_CATEGORIES};

/// Credential variables whose presence (never value) is reported.
pub const CREDENTIAL_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_PROFILE",
];

/// Which credential variables are set, according to `is_set`.
pub fn credential_presence<F>(is_set: F) -> Vec<(&'static str, bool)>
where
    F: Fn(&str) -> bool,
{
    CREDENTIAL_VARS.iter().map(|name| (*name, is_set(name))).collect()
}

/// Log the startup banner; with diagnostics enabled also credentials and
/// the full model inventory.
pub fn log_boot<F>(config: &WorkerConfig, is_set: F)
where
    F: Fn(&str) -> bool,
{
    let remote = config
        .remote
        .as_ref()
        .map(|r| format!("s3://{}/{} ({})", r.bucket, r.prefix, r.region))
        .unwrap_or_else(|| "none".to_string());

    tracing::info!(
        image_version = %config.image_version,
        model_dir = %config.model_root.display(),
        output_dir = %config.output_root.display(),
        engine_root = %config.engine.root.display(),
        engine = %config.engine_api_url(),
        remote = %remote,
        fetch_backend = ?config.fetch_backend,
        "Worker starting",
    );

    if !config.diagnostics {
        return;
    }

    for (name, present) in credential_presence(is_set) {
        tracing::info!(variable = name, present, "Credential variable");
    }

    let inventory = AssetInventory::scan(&config.model_root);
    for &category in MODEL_CATEGORIES {
        let files = inventory.files(category);
        tracing::info!(category, count = files.len(), files = ?files, "Model inventory");
    }
}
