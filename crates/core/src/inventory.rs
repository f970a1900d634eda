//! Snapshot of model files present under the model root.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Checkpoint category directory name.
pub const CATEGORY_CHECKPOINTS: &str = "checkpoints";

/// Category directories inspected under the model root, in summary order.
pub const MODEL_CATEGORIES: &[&str] = &[
    CATEGORY_CHECKPOINTS,
    "vae",
    "loras",
    "clip",
    "upscale_models",
    "controlnet",
    "embeddings",
];

/// Number of names sampled per category in [`AssetInventory::summary`].
const SUMMARY_SAMPLE: usize = 3;

/// Point-in-time mapping of category name to the filenames it contains.
///
/// Built by [`AssetInventory::scan`]; it is never refreshed, so take a new
/// snapshot after anything writes to the model root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetInventory {
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl AssetInventory {
    /// Inspect each known category directory under `model_root`.
    ///
    /// Only regular files directly inside the category directory count.
    /// A missing or unreadable directory yields an empty category.
    pub fn scan(model_root: &Path) -> Self {
        let mut categories = BTreeMap::new();
        for &category in MODEL_CATEGORIES {
            let dir = model_root.join(category);
            let names = match std::fs::read_dir(&dir) {
                Ok(entries) => entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(dir = %dir.display(), error = %e, "Cannot read model directory");
                    }
                    BTreeSet::new()
                }
            };
            categories.insert(category.to_string(), names);
        }
        Self { categories }
    }

    /// Build an inventory from explicit contents.
    pub fn from_categories<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: Into<String>,
    {
        let categories = entries
            .into_iter()
            .map(|(k, v)| {
                let names: BTreeSet<String> = v.into_iter().map(Into::into).collect();
                (k.into(), names)
            })
            .collect::<BTreeMap<String, _>>();
        Self { categories }
    }

    /// Filenames in `category`, sorted lexicographically.
    pub fn files(&self, category: &str) -> Vec<&str> {
        self.categories
            .get(category)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Sorted checkpoint filenames.
    pub fn checkpoints(&self) -> Vec<&str> {
        self.files(CATEGORY_CHECKPOINTS)
    }

    pub fn contains(&self, category: &str, name: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|set| set.contains(name))
    }

    /// One-line human summary, e.g. `checkpoints: 2 [a.ckpt, b.ckpt] | vae: 0 | ...`.
    pub fn summary(&self) -> String {
        MODEL_CATEGORIES
            .iter()
            .map(|&category| {
                let files = self.files(category);
                let sample = files
                    .iter()
                    .take(SUMMARY_SAMPLE)
                    .copied()
                    .collect::<Vec<_>>()
                    .join(", ");
                if sample.is_empty() {
                    format!("{category}: {}", files.len())
                } else {
                    format!("{category}: {} [{sample}]", files.len())
                }
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_lists_files_per_category() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ckpts = dir.path().join("checkpoints");
        std::fs::create_dir_all(ckpts.join("nested")).expect("mkdir");
        std::fs::write(ckpts.join("b.ckpt"), b"b").expect("write");
        std::fs::write(ckpts.join("a.ckpt"), b"a").expect("write");
        std::fs::write(ckpts.join("nested/c.ckpt"), b"c").expect("write");

        let inv = AssetInventory::scan(dir.path());
        assert_eq!(inv.checkpoints(), vec!["a.ckpt", "b.ckpt"]);
        assert!(inv.files("loras").is_empty());
        assert!(inv.contains("checkpoints", "a.ckpt"));
        assert!(!inv.contains("checkpoints", "c.ckpt"));
    }

    #[test]
    fn scan_is_a_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inv = AssetInventory::scan(dir.path());
        std::fs::create_dir_all(dir.path().join("vae")).expect("mkdir");
        std::fs::write(dir.path().join("vae/x.pt"), b"x").expect("write");
        assert!(inv.files("vae").is_empty());
        assert_eq!(AssetInventory::scan(dir.path()).files("vae"), vec!["x.pt"]);
    }

    #[test]
    fn summary_samples_three_names() {
        let inv = AssetInventory::from_categories([(
            "checkpoints",
            vec!["d.ckpt", "a.ckpt", "c.ckpt", "b.ckpt"],
        )]);
        let summary = inv.summary();
        assert!(summary.starts_with("checkpoints: 4 [a.ckpt, b.ckpt, c.ckpt] | vae: 0"));
        assert!(summary.ends_with("embeddings: 0"));
    }
}
