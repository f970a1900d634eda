//! Output image collection.
//!
//! Gathers the newest images the engine wrote during this job, encodes
//! them as base64 and hands them back for the response payload. A file
//! that cannot be read is logged and skipped.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use renderpod_core::images::is_image_path;
use renderpod_core::job::EncodedImage;
use walkdir::WalkDir;

use crate::poller::ImageSnapshot;

/// Most images returned for one job.
pub const MAX_IMAGES: usize = 8;

/// The engine reported completion but nothing could be collected.
#[derive(Debug, thiserror::Error)]
#[error("engine finished but no images could be collected from {dir} ({candidates} candidate files)")]
pub struct EmptyResultError {
    pub dir: String,
    /// New image files found before reading; all of them failed if non-zero.
    pub candidates: usize,
}

/// [`collect_images`] on the blocking thread pool.
pub async fn collect_new_images(
    dir: PathBuf,
    baseline: ImageSnapshot,
    limit: usize,
) -> Result<Vec<EncodedImage>, EmptyResultError> {
    let task_dir = dir.clone();
    match tokio::task::spawn_blocking(move || collect_images(&task_dir, &baseline, limit)).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "Output collection task failed");
            Err(EmptyResultError {
                dir: dir.display().to_string(),
                candidates: 0,
            })
        }
    }
}

/// Collect up to `limit` of the most recently modified new images in `dir`.
///
/// Files in `baseline` are excluded. Ties in modification time are broken
/// by path so the result is deterministic.
pub fn collect_images(
    dir: &Path,
    baseline: &ImageSnapshot,
    limit: usize,
) -> Result<Vec<EncodedImage>, EmptyResultError> {
    collect_with(dir, baseline, limit, |path| std::fs::read(path))
}

fn collect_with<F>(
    dir: &Path,
    baseline: &ImageSnapshot,
    limit: usize,
    read: F,
) -> Result<Vec<EncodedImage>, EmptyResultError>
where
    F: Fn(&Path) -> std::io::Result<Vec<u8>>,
{
    let mut candidates: Vec<(PathBuf, SystemTime)> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_image_path(entry.path()))
        .filter(|entry| !baseline.contains(entry.path()))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.into_path(), modified)
        })
        .collect();

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let found = candidates.len();

    let images: Vec<EncodedImage> = candidates
        .into_iter()
        .take(limit)
        .filter_map(|(path, _)| encode_file(&path, &read))
        .collect();

    if images.is_empty() {
        return Err(EmptyResultError {
            dir: dir.display().to_string(),
            candidates: found,
        });
    }

    tracing::info!(collected = images.len(), found, "Collected output images");
    Ok(images)
}

fn encode_file<F>(path: &Path, read: &F) -> Option<EncodedImage>
where
    F: Fn(&Path) -> std::io::Result<Vec<u8>>,
{
    let bytes = match read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable output image");
            return None;
        }
    };
    let filename = path.file_name()?.to_string_lossy().into_owned();
    Some(EncodedImage {
        filename,
        content_b64: STANDARD.encode(bytes),
    })
}
