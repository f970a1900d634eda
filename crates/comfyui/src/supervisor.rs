//! Engine subprocess supervision.
//!
//! [`ServerProcess::launch`] tries each [`CommandTemplate`] in order until
//! one is still running after the launch grace window.
//! [`ServerProcess::wait_until_ready`] polls the engine port, and
//! [`ServerProcess::shutdown`] terminates the process on every exit path.
//! The child is spawned with `kill_on_drop(true)` as a backstop in case a
//! caller drops the handle without shutting it down.
//!
//! On Unix the engine leads its own process group and every signal goes to
//! the whole group, so a wrapper script cannot leave the real engine behind.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::command::{CommandTemplate, LaunchContext, ResolvedCommand, ARGUMENT_ERROR_EXIT_CODE};
use crate::logs::{spawn_forwarder, StreamKind, TailBuffer};

/// Upper bound on a single readiness connection attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait for log forwarders to flush after the engine exits.
const FORWARDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of the supervised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Running, port not yet accepting connections.
    Starting,
    /// Port accepts connections.
    Ready,
    /// Exited before becoming ready.
    Crashed,
    /// Shut down by the supervisor.
    Terminated,
}

/// Errors that can occur while starting or supervising the engine.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no engine command candidates configured")]
    NoCandidates,

    /// Every candidate exited during the launch grace window or failed to spawn.
    #[error("no engine command started: {}", .attempts.join("; "))]
    NoCandidateStarted { attempts: Vec<String> },

    /// The engine exited after launch but before opening its port.
    #[error("engine exited before opening port {port} (exit code {code:?}): {stderr_tail}")]
    Crashed {
        port: u16,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("engine did not open port {port} within {}s", .timeout.as_secs_f64())]
    ReadinessTimeout { port: u16, timeout: Duration },

    #[error("I/O error while supervising engine: {0}")]
    Io(#[from] std::io::Error),
}

/// Timing knobs for launch and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    /// A candidate still running after this long counts as started.
    pub launch_grace: Duration,
    /// Wait after SIGTERM before killing.
    pub terminate_grace: Duration,
}

/// A running engine process bound to a loopback port.
pub struct ServerProcess {
    child: Child,
    host: String,
    port: u16,
    state: ServerState,
    label: String,
    stderr_tail: TailBuffer,
    forwarders: Vec<JoinHandle<()>>,
    terminate_grace: Duration,
    /// Process group led by the engine; stays valid after the leader is reaped.
    process_group: Option<u32>,
}

impl fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcess")
            .field("label", &self.label)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

/// Result of starting one candidate.
enum Attempt {
    Running(ServerProcess),
    Exited { code: Option<i32>, stderr_tail: String },
}

impl ServerProcess {
    /// Start the first candidate that survives the launch grace window.
    ///
    /// A candidate that exits with [`ARGUMENT_ERROR_EXIT_CODE`] is retried
    /// once with its flag fallbacks before moving on to the next one.
    pub async fn launch(
        candidates: &[CommandTemplate],
        ctx: &LaunchContext,
        options: LaunchOptions,
    ) -> Result<Self, SupervisorError> {
        if candidates.is_empty() {
            return Err(SupervisorError::NoCandidates);
        }

        let mut attempts = Vec::new();
        for template in candidates {
            let mut current = template.clone();
            let mut retried = false;
            loop {
                let resolved = current.render(ctx);
                tracing::info!(
                    candidate = %current.label,
                    interface = %current.interface_version,
                    command = %resolved.display(),
                    "Starting engine",
                );

                match Self::try_start(&current.label, &resolved, ctx, options).await {
                    Ok(Attempt::Running(process)) => return Ok(process),
                    Ok(Attempt::Exited { code, stderr_tail }) => {
                        tracing::warn!(
                            candidate = %current.label,
                            exit_code = ?code,
                            "Engine exited during launch",
                        );
                        attempts.push(format!(
                            "{} exited with code {code:?}: {stderr_tail}",
                            current.label
                        ));
                        if code == Some(ARGUMENT_ERROR_EXIT_CODE) && !retried {
                            if let Some(fallback) = current.with_fallback_flags() {
                                tracing::info!(
                                    candidate = %current.label,
                                    "Argument error, retrying with fallback flags",
                                );
                                current = fallback;
                                retried = true;
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(candidate = %current.label, error = %e, "Engine failed to spawn");
                        attempts.push(format!("{} failed to spawn: {e}", current.label));
                    }
                }
                break;
            }
        }

        Err(SupervisorError::NoCandidateStarted { attempts })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, or `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Label of the candidate that started.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Most recent stderr output, bounded.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Poll the engine port until it accepts a connection.
    ///
    /// Returns the time readiness took. Fails early with
    /// [`SupervisorError::Crashed`] if the process exits first, or with
    /// [`SupervisorError::ReadinessTimeout`] once `timeout` has elapsed.
    pub async fn wait_until_ready(
        &mut self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Duration, SupervisorError> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.flush_forwarders().await;
                self.state = ServerState::Crashed;
                let stderr_tail = self.stderr_tail();
                tracing::error!(
                    port = self.port,
                    exit_code = ?status.code(),
                    "Engine exited before opening its port",
                );
                return Err(SupervisorError::Crashed {
                    port: self.port,
                    code: status.code(),
                    stderr_tail,
                });
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                tracing::error!(port = self.port, timeout_secs = timeout.as_secs_f64(), "Engine readiness timed out");
                return Err(SupervisorError::ReadinessTimeout {
                    port: self.port,
                    timeout,
                });
            }

            if port_accepts(&self.host, self.port, remaining.min(CONNECT_ATTEMPT_TIMEOUT)).await {
                self.state = ServerState::Ready;
                let elapsed = start.elapsed();
                tracing::info!(
                    port = self.port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Engine is ready",
                );
                return Ok(elapsed);
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    /// Stop the engine: SIGTERM, bounded wait, then kill.
    ///
    /// Safe to call in any state and more than once.
    pub async fn shutdown(&mut self) {
        if self.state == ServerState::Terminated {
            return;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(exit = %describe_exit(status), "Engine already exited");
            }
            _ => {
                request_terminate(&mut self.child, self.process_group);
                match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::info!(exit = %describe_exit(status), "Engine terminated");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Waiting for engine failed, killing");
                        self.force_kill().await;
                    }
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = self.terminate_grace.as_secs_f64(),
                            "Engine ignored terminate, killing",
                        );
                        self.force_kill().await;
                    }
                }
            }
        }

        kill_stragglers(self.process_group);
        self.flush_forwarders().await;
        self.state = ServerState::Terminated;
    }

    // ---- private helpers ----

    /// Spawn one resolved command and watch it for the launch grace window.
    async fn try_start(
        label: &str,
        resolved: &ResolvedCommand,
        ctx: &LaunchContext,
        options: LaunchOptions,
    ) -> Result<Attempt, std::io::Error> {
        let mut command = Command::new(&resolved.program);
        command
            .args(&resolved.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        let process_group = if cfg!(unix) { child.id() } else { None };

        let stderr_tail = TailBuffer::default();
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(spawn_forwarder(stdout, StreamKind::Stdout, None));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(spawn_forwarder(
                stderr,
                StreamKind::Stderr,
                Some(stderr_tail.clone()),
            ));
        }

        let mut process = ServerProcess {
            child,
            host: ctx.host.clone(),
            port: ctx.port,
            state: ServerState::Starting,
            label: label.to_string(),
            stderr_tail,
            forwarders,
            terminate_grace: options.terminate_grace,
            process_group,
        };

        let early_exit = tokio::time::timeout(options.launch_grace, process.child.wait()).await;
        match early_exit {
            Err(_still_running) => {
                tracing::info!(candidate = %label, pid = ?process.pid(), port = ctx.port, "Engine process started");
                Ok(Attempt::Running(process))
            }
            Ok(Ok(status)) => {
                kill_stragglers(process.process_group);
                process.flush_forwarders().await;
                process.state = ServerState::Crashed;
                Ok(Attempt::Exited {
                    code: status.code(),
                    stderr_tail: process.stderr_tail(),
                })
            }
            Ok(Err(e)) => Err(e),
        }
    }

    async fn force_kill(&mut self) {
        signal_group(self.process_group, KILL);
        if let Err(e) = self.child.kill().await {
            tracing::error!(error = %e, "Failed to kill engine process");
        }
    }

    /// Let the forwarders drain what the engine wrote before exiting.
    ///
    /// A grandchild holding the pipes open would keep them alive forever,
    /// so they are aborted after [`FORWARDER_FLUSH_TIMEOUT`].
    async fn flush_forwarders(&mut self) {
        for handle in self.forwarders.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(FORWARDER_FLUSH_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Whether a TCP connection to `host:port` succeeds within `timeout`.
async fn port_accepts(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
const TERMINATE: i32 = libc::SIGTERM;
#[cfg(unix)]
const KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const TERMINATE: i32 = 15;
#[cfg(not(unix))]
const KILL: i32 = 9;

/// Ask the engine to exit gracefully.
fn request_terminate(child: &mut Child, process_group: Option<u32>) {
    if signal_group(process_group, TERMINATE) {
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to stop engine process");
    }
}

/// Kill whatever is left in the engine's process group once the leader is gone.
fn kill_stragglers(process_group: Option<u32>) {
    signal_group(process_group, KILL);
}

/// Send `signal` to every process in the group. Returns false when there is
/// no group to signal.
#[cfg(unix)]
fn signal_group(process_group: Option<u32>, signal: i32) -> bool {
    let Some(pgid) = process_group else {
        return false;
    };
    // SAFETY: a negative pid addresses the process group we created at spawn.
    let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, signal, error = %err, "Signalling engine process group failed");
        }
    }
    true
}

#[cfg(not(unix))]
fn signal_group(_process_group: Option<u32>, _signal: i32) -> bool {
    false
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}
