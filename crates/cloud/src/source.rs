//! Remote object source abstraction.
//!
//! A [`RemoteSource`] copies one object, addressed by key, into a local
//! file. The cache synchronizer only ever needs this single operation, so
//! backends stay small and tests can substitute an in-memory source.

use std::path::Path;

use async_trait::async_trait;

/// Maximum characters of subprocess stderr kept in a [`FetchError`].
pub(crate) const MAX_ERROR_OUTPUT_CHARS: usize = 500;

/// Errors from a single object fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The object does not exist in the remote store.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The SDK request failed (credentials, network, permissions).
    #[error("S3 request failed: {0}")]
    Sdk(String),

    /// The copy command ran but exited unsuccessfully.
    #[error("{program} exited with code {code}: {stderr}")]
    CommandFailed {
        program: String,
        /// Process exit code (`-1` if killed by signal).
        code: i32,
        stderr: String,
    },

    /// The manifest entry cannot be mapped to a local path.
    #[error("invalid manifest entry: {0}")]
    InvalidEntry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Exit code of the copy command, when the backend is a subprocess.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A get-by-key blob store.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// URI of `key` for log messages, e.g. `s3://bucket/models/a.ckpt`.
    fn uri(&self, key: &str) -> String;

    /// Copy the object at `key` into the file at `dest`.
    ///
    /// `dest`'s parent directory already exists. On error the caller
    /// removes whatever partial file was written.
    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Keep at most [`MAX_ERROR_OUTPUT_CHARS`] of a diagnostic string.
pub(crate) fn truncate_output(text: &str) -> String {
    text.trim().chars().take(MAX_ERROR_OUTPUT_CHARS).collect()
}
