//! Pointing the engine at the worker's model root.
//!
//! ComfyUI reads `extra_model_paths.yaml` from its checkout directory to
//! discover model folders outside `models/`. Older builds ignore that file,
//! so `models/` itself is also linked to the model root where possible.
//! Both keep what the engine loads in line with the inventory the worker
//! reconciles against.

use std::path::{Path, PathBuf};

use renderpod_core::inventory::MODEL_CATEGORIES;

/// File name ComfyUI looks for in its root directory.
pub const EXTRA_MODEL_PATHS_FILE: &str = "extra_model_paths.yaml";

/// Section name used inside the YAML document.
const SECTION_NAME: &str = "renderpod";

/// Render the YAML document for `model_root`.
pub fn render_extra_model_paths(model_root: &Path) -> String {
    let mut yaml = format!(
        "{SECTION_NAME}:\n  base_path: {}\n",
        model_root.display()
    );
    for category in MODEL_CATEGORIES {
        yaml.push_str(&format!("  {category}: {category}/\n"));
    }
    yaml
}

/// Write the YAML document into `engine_root`, returning its path.
pub async fn write_extra_model_paths(
    engine_root: &Path,
    model_root: &Path,
) -> std::io::Result<PathBuf> {
    let path = engine_root.join(EXTRA_MODEL_PATHS_FILE);
    tokio::fs::write(&path, render_extra_model_paths(model_root)).await?;
    Ok(path)
}

/// Outcome of [`link_models_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelsLink {
    /// `models` was missing or an empty directory and now links to the model root.
    Created,
    /// `models` is already a symlink; left untouched.
    AlreadyLinked,
    /// `models` is a directory with content; left untouched.
    ExistingDirectory,
}

/// Make `engine_root/models` a symlink to `model_root`.
///
/// An empty `models` directory is replaced. A populated one is never
/// modified.
#[cfg(unix)]
pub async fn link_models_dir(engine_root: &Path, model_root: &Path) -> std::io::Result<ModelsLink> {
    let link = engine_root.join("models");
    match tokio::fs::symlink_metadata(&link).await {
        Ok(meta) if meta.file_type().is_symlink() => return Ok(ModelsLink::AlreadyLinked),
        Ok(meta) if meta.is_dir() => {
            let mut entries = tokio::fs::read_dir(&link).await?;
            if entries.next_entry().await?.is_some() {
                return Ok(ModelsLink::ExistingDirectory);
            }
            tokio::fs::remove_dir(&link).await?;
        }
        Ok(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", link.display()),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::symlink(model_root, &link).await?;
    Ok(ModelsLink::Created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_every_category() {
        let yaml = render_extra_model_paths(Path::new("/runpod-volume/models"));
        assert!(yaml.starts_with("renderpod:\n  base_path: /runpod-volume/models\n"));
        for category in MODEL_CATEGORIES {
            assert!(yaml.contains(&format!("  {category}: {category}/\n")));
        }
    }

    #[tokio::test]
    async fn writes_into_engine_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_extra_model_paths(dir.path(), Path::new("/m"))
            .await
            .expect("write");
        assert_eq!(path, dir.path().join(EXTRA_MODEL_PATHS_FILE));
        let text = std::fs::read_to_string(path).expect("read");
        assert!(text.contains("checkpoints: checkpoints/"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn links_missing_or_empty_models_dir() {
        let engine = tempfile::tempdir().expect("tempdir");
        let models = tempfile::tempdir().expect("tempdir");

        let outcome = link_models_dir(engine.path(), models.path()).await.expect("link");
        assert_eq!(outcome, ModelsLink::Created);
        let link = engine.path().join("models");
        assert_eq!(std::fs::read_link(&link).expect("read_link"), models.path());

        let again = link_models_dir(engine.path(), models.path()).await.expect("link");
        assert_eq!(again, ModelsLink::AlreadyLinked);

        let empty = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(empty.path().join("models")).expect("mkdir");
        let replaced = link_models_dir(empty.path(), models.path()).await.expect("link");
        assert_eq!(replaced, ModelsLink::Created);
        assert!(std::fs::symlink_metadata(empty.path().join("models"))
            .expect("meta")
            .file_type()
            .is_symlink());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn populated_models_dir_is_left_alone() {
        let engine = tempfile::tempdir().expect("tempdir");
        let existing = engine.path().join("models/checkpoints");
        std::fs::create_dir_all(&existing).expect("mkdir");
        std::fs::write(existing.join("base.safetensors"), b"x").expect("write");

        let outcome = link_models_dir(engine.path(), Path::new("/runpod-volume/models"))
            .await
            .expect("link");
        assert_eq!(outcome, ModelsLink::ExistingDirectory);
        assert!(existing.join("base.safetensors").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_engine_root_is_an_error() {
        let result = link_models_dir(Path::new("/nonexistent/engine"), Path::new("/m")).await;
        assert!(result.is_err());
    }
}
