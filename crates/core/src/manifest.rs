//! Model manifest parsing.
//!
//! A manifest is a UTF-8 text file listing one relative asset path per
//! line, e.g. `checkpoints/sd15.safetensors`. Blank lines and lines
//! starting with `#` carry no entry.

use std::path::{Component, Path, PathBuf};

use crate::error::CoreError;

/// Marker that starts a comment line.
const COMMENT_PREFIX: char = '#';

/// One asset listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based line number in the source file, for log messages.
    pub line_no: usize,
    /// The trimmed relative path exactly as written.
    pub relative_path: String,
}

impl ManifestEntry {
    /// Local destination for this asset under `root`.
    ///
    /// Rejects absolute paths and `..` components so that a manifest can
    /// never write outside the model root.
    pub fn destination(&self, root: &Path) -> Result<PathBuf, CoreError> {
        let rel = Path::new(&self.relative_path);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(CoreError::Validation(format!(
                "Manifest line {} escapes the model root: '{}'",
                self.line_no, self.relative_path
            )));
        }
        Ok(root.join(rel))
    }

    /// Remote object key for this asset: `prefix + relative_path`.
    pub fn remote_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.relative_path)
    }
}

/// Parse manifest text into entries, in file order.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
                return None;
            }
            Some(ManifestEntry {
                line_no: idx + 1,
                relative_path: line.to_string(),
            })
        })
        .collect()
}

/// Read and parse a manifest file.
///
/// Returns `Ok(None)` when the file does not exist, which callers treat
/// as "nothing to sync".
pub fn load_manifest(path: &Path) -> Result<Option<Vec<ManifestEntry>>, CoreError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(parse_manifest(&text))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let text = "# models\n\ncheckpoints/a.ckpt\n   \n  # indented comment\nloras/b.safetensors\n";
        let entries = parse_manifest(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "checkpoints/a.ckpt");
        assert_eq!(entries[0].line_no, 3);
        assert_eq!(entries[1].relative_path, "loras/b.safetensors");
        assert_eq!(entries[1].line_no, 6);
    }

    #[test]
    fn only_comments_yields_nothing() {
        assert!(parse_manifest("#a\n#b\n\n").is_empty());
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let entries = parse_manifest("  vae/x.pt  \r\n");
        assert_eq!(entries[0].relative_path, "vae/x.pt");
    }

    #[test]
    fn destination_joins_root() {
        let entry = ManifestEntry {
            line_no: 1,
            relative_path: "checkpoints/a.ckpt".into(),
        };
        let dest = entry.destination(Path::new("/models")).expect("dest");
        assert_eq!(dest, PathBuf::from("/models/checkpoints/a.ckpt"));
    }

    #[test]
    fn destination_rejects_escape() {
        for bad in ["../etc/passwd", "/abs/path", "checkpoints/../../x"] {
            let entry = ManifestEntry {
                line_no: 7,
                relative_path: bad.into(),
            };
            assert_matches!(
                entry.destination(Path::new("/models")),
                Err(CoreError::Validation(_))
            );
        }
    }

    #[test]
    fn remote_key_prepends_prefix() {
        let entry = ManifestEntry {
            line_no: 1,
            relative_path: "checkpoints/a.ckpt".into(),
        };
        assert_eq!(entry.remote_key("models/"), "models/checkpoints/a.ckpt");
        assert_eq!(entry.remote_key(""), "checkpoints/a.ckpt");
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = load_manifest(&dir.path().join("absent.txt")).expect("load");
        assert!(result.is_none());
    }
}
