//! Worker configuration.
//!
//! [`WorkerConfig`] is read from the environment once at startup and then
//! passed by reference into every component. Nothing else in the
//! workspace reads environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Remote model source (an S3 bucket and key prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSourceConfig {
    pub bucket: String,
    /// Prepended verbatim to each manifest line to form the object key.
    pub prefix: String,
    pub region: String,
}

/// How objects are fetched from the remote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchBackend {
    /// In-process AWS SDK client.
    #[default]
    Sdk,
    /// Shell out to `aws s3 cp`.
    Cli,
}

impl FromStr for FetchBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sdk" => Ok(Self::Sdk),
            "cli" => Ok(Self::Cli),
            other => Err(CoreError::Config(format!(
                "FETCH_BACKEND must be 'sdk' or 'cli', got '{other}'"
            ))),
        }
    }
}

/// Rendering engine launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Engine checkout directory (holds `main.py`).
    pub root: PathBuf,
    /// Loopback address the engine binds to.
    pub host: String,
    pub port: u16,
    /// Whitespace-separated command template replacing the built-in candidates.
    pub command_override: Option<String>,
    /// Write `extra_model_paths.yaml` into [`Self::root`] before launch.
    pub write_model_paths: bool,
}

/// Stage deadlines and poll intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Overall wait for the engine port to accept connections.
    pub readiness: Duration,
    /// Overall wait for a new output image after submission.
    pub completion: Duration,
    /// Interval for both the readiness and completion polls.
    pub poll_interval: Duration,
    /// Pause after readiness before submitting.
    pub settle_delay: Duration,
    /// Grace period after SIGTERM before the engine is killed.
    pub terminate_grace: Duration,
    /// A launched candidate still running after this long counts as started.
    pub launch_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(300),
            completion: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(5),
            launch_grace: Duration::from_secs(1),
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub model_root: PathBuf,
    pub output_root: PathBuf,
    pub manifest_path: PathBuf,
    /// `None` disables model sync entirely.
    pub remote: Option<RemoteSourceConfig>,
    pub fetch_backend: FetchBackend,
    /// Abort the sync on the first failed fetch instead of skipping it.
    pub strict_sync: bool,
    pub engine: EngineConfig,
    /// Checkpoint applied to every loader node, bypassing reconciliation.
    pub forced_checkpoint: Option<String>,
    pub diagnostics: bool,
    pub timeouts: Timeouts,
    /// Build identifier reported in boot logs.
    pub image_version: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                          |
    /// |---------------------------|----------------------------------|
    /// | `MODEL_DIR`               | `/runpod-volume/models`          |
    /// | `OUTPUT_DIR`              | `/runpod-volume/out`             |
    /// | `MODEL_MANIFEST`          | `/workspace/model_manifest.txt`  |
    /// | `S3_BUCKET`               | unset (sync disabled)            |
    /// | `S3_PREFIX`               | `models/`                        |
    /// | `AWS_REGION`              | `us-east-1`                      |
    /// | `FETCH_BACKEND`           | `sdk`                            |
    /// | `STRICT_SYNC`             | `false`                          |
    /// | `ENGINE_ROOT`             | `/workspace/ComfyUI`             |
    /// | `ENGINE_HOST`             | `127.0.0.1`                      |
    /// | `ENGINE_PORT`             | `8188`                           |
    /// | `ENGINE_COMMAND`          | unset (built-in candidates)      |
    /// | `WRITE_MODEL_PATHS`       | `true`                           |
    /// | `FORCED_CKPT`             | unset                            |
    /// | `DIAGNOSTICS`             | `false`                          |
    /// | `READINESS_TIMEOUT_SECS`  | `300`                            |
    /// | `COMPLETION_TIMEOUT_SECS` | `300`                            |
    /// | `POLL_INTERVAL_MS`        | `500`                            |
    /// | `SETTLE_DELAY_MS`         | `2000`                           |
    /// | `TERMINATE_GRACE_SECS`    | `5`                              |
    /// | `LAUNCH_GRACE_MS`         | `1000`                           |
    /// | `IMAGE_VERSION`           | `unknown`                        |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let path_or = |key: &str, default: &str| PathBuf::from(get(key).unwrap_or_else(|| default.into()));

        let remote = get("S3_BUCKET").map(|bucket| RemoteSourceConfig {
            bucket,
            prefix: lookup("S3_PREFIX").unwrap_or_else(|| "models/".into()),
            region: get("AWS_REGION").unwrap_or_else(|| "us-east-1".into()),
        });

        let fetch_backend = match get("FETCH_BACKEND") {
            Some(v) => v.parse()?,
            None => FetchBackend::default(),
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            readiness: secs(&get, "READINESS_TIMEOUT_SECS", defaults.readiness)?,
            completion: secs(&get, "COMPLETION_TIMEOUT_SECS", defaults.completion)?,
            poll_interval: millis(&get, "POLL_INTERVAL_MS", defaults.poll_interval)?,
            settle_delay: millis(&get, "SETTLE_DELAY_MS", defaults.settle_delay)?,
            terminate_grace: secs(&get, "TERMINATE_GRACE_SECS", defaults.terminate_grace)?,
            launch_grace: millis(&get, "LAUNCH_GRACE_MS", defaults.launch_grace)?,
        };
        if timeouts.poll_interval.is_zero() {
            return Err(CoreError::Config("POLL_INTERVAL_MS must be greater than zero".into()));
        }

        let engine = EngineConfig {
            root: path_or("ENGINE_ROOT", "/workspace/ComfyUI"),
            host: get("ENGINE_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parse_or(&get, "ENGINE_PORT", 8188)?,
            command_override: get("ENGINE_COMMAND"),
            write_model_paths: flag(&get, "WRITE_MODEL_PATHS", true)?,
        };

        Ok(Self {
            model_root: path_or("MODEL_DIR", "/runpod-volume/models"),
            output_root: path_or("OUTPUT_DIR", "/runpod-volume/out"),
            manifest_path: path_or("MODEL_MANIFEST", "/workspace/model_manifest.txt"),
            remote,
            fetch_backend,
            strict_sync: flag(&get, "STRICT_SYNC", false)?,
            engine,
            forced_checkpoint: get("FORCED_CKPT"),
            diagnostics: flag(&get, "DIAGNOSTICS", false)?,
            timeouts,
            image_version: get("IMAGE_VERSION").unwrap_or_else(|| "unknown".into()),
        })
    }

    /// Base HTTP URL of the local engine, e.g. `http://127.0.0.1:8188`.
    pub fn engine_api_url(&self) -> String {
        format!("http://{}:{}", self.engine.host, self.engine.port)
    }
}

// ---- private helpers ----

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, CoreError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis<G>(get: &G, key: &str, default: Duration) -> Result<Duration, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn flag<G>(get: &G, key: &str, default: bool) -> Result<bool, CoreError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(CoreError::Config(format!("{key} must be a boolean, got '{v}'"))),
        },
    }
}
