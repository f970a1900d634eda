//! Engine invocation candidates.
//!
//! The engine can be started through several entrypoints (a venv Python,
//! the system Python, an operator-supplied command). Each is a
//! [`CommandTemplate`] whose arguments may contain placeholders filled in
//! from a [`LaunchContext`] at launch time.

use std::path::PathBuf;

use renderpod_core::config::WorkerConfig;

/// Exit code that argument parsers use for "unrecognised argument".
///
/// Seeing it right after launch triggers a single retry with the
/// template's flag fallbacks applied. This is a heuristic: an engine build
/// is free to exit 2 for other reasons.
pub const ARGUMENT_ERROR_EXIT_CODE: i32 = 2;

/// Replace `flag` with `alternate` when retrying after an argument error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagFallback {
    pub flag: String,
    pub alternate: String,
}

impl FlagFallback {
    pub fn new(flag: &str, alternate: &str) -> Self {
        Self {
            flag: flag.to_string(),
            alternate: alternate.to_string(),
        }
    }
}

/// One way of starting the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Short name for logs, e.g. `venv-python`.
    pub label: String,
    /// Engine interface this template targets.
    pub interface_version: String,
    pub program: String,
    pub args: Vec<String>,
    pub flag_fallbacks: Vec<FlagFallback>,
}

/// Values substituted into template placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub engine_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub output_dir: PathBuf,
    pub model_root: PathBuf,
}

impl LaunchContext {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            engine_root: config.engine.root.clone(),
            host: config.engine.host.clone(),
            port: config.engine.port,
            output_dir: config.output_root.clone(),
            model_root: config.model_root.clone(),
        }
    }

    /// Substitute `{engine_root}`, `{host}`, `{port}`, `{output_dir}` and
    /// `{model_root}` in `text`.
    pub fn expand(&self, text: &str) -> String {
        text.replace("{engine_root}", &self.engine_root.to_string_lossy())
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
            .replace("{output_dir}", &self.output_dir.to_string_lossy())
            .replace("{model_root}", &self.model_root.to_string_lossy())
    }
}

/// A template with every placeholder filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    /// Shell-like rendering for log lines.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl CommandTemplate {
    /// Parse a whitespace-separated command line into a template.
    ///
    /// Returns `None` for a blank line.
    pub fn parse(label: &str, line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            label: label.to_string(),
            interface_version: "custom".to_string(),
            program,
            args: parts.collect(),
            flag_fallbacks: default_flag_fallbacks(),
        })
    }

    pub fn render(&self, ctx: &LaunchContext) -> ResolvedCommand {
        ResolvedCommand {
            program: ctx.expand(&self.program),
            args: self.args.iter().map(|a| ctx.expand(a)).collect(),
        }
    }

    /// This template with its flag fallbacks applied.
    ///
    /// Returns `None` when no fallback flag appears in the arguments, so a
    /// retry would be identical to the first attempt.
    pub fn with_fallback_flags(&self) -> Option<Self> {
        let mut changed = false;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                match self.flag_fallbacks.iter().find(|f| &f.flag == arg) {
                    Some(fallback) => {
                        changed = true;
                        fallback.alternate.clone()
                    }
                    None => arg.clone(),
                }
            })
            .collect();
        changed.then(|| Self {
            label: format!("{} (fallback flags)", self.label),
            args,
            ..self.clone()
        })
    }
}

/// Flag respellings known across engine releases.
pub fn default_flag_fallbacks() -> Vec<FlagFallback> {
    vec![FlagFallback::new("--output-directory", "--output-dir")]
}

/// Arguments shared by the built-in candidates.
fn engine_args() -> Vec<String> {
    [
        "{engine_root}/main.py",
        "--disable-auto-launch",
        "--listen",
        "{host}",
        "--port",
        "{port}",
        "--output-directory",
        "{output_dir}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Built-in candidates, in priority order.
pub fn default_candidates() -> Vec<CommandTemplate> {
    vec![
        CommandTemplate {
            label: "venv-python".to_string(),
            interface_version: "comfyui-main".to_string(),
            program: "{engine_root}/.venv/bin/python".to_string(),
            args: engine_args(),
            flag_fallbacks: default_flag_fallbacks(),
        },
        CommandTemplate {
            label: "system-python".to_string(),
            interface_version: "comfyui-main".to_string(),
            program: "python3".to_string(),
            args: engine_args(),
            flag_fallbacks: default_flag_fallbacks(),
        },
    ]
}

/// Candidates for this worker: the configured override alone, or the defaults.
pub fn candidates_from_config(config: &WorkerConfig) -> Vec<CommandTemplate> {
    match config
        .engine
        .command_override
        .as_deref()
        .and_then(|line| CommandTemplate::parse("configured", line))
    {
        Some(template) => vec![template],
        None => default_candidates(),
    }
}
