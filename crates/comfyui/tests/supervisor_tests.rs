//! Integration tests for engine launch, readiness and teardown.
//!
//! Small `sh` scripts stand in for the engine; readiness is simulated by
//! binding the engine port from the test itself.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use renderpod_comfyui::command::{CommandTemplate, FlagFallback, LaunchContext};
use renderpod_comfyui::supervisor::{LaunchOptions, ServerProcess, ServerState, SupervisorError};
use tokio::net::TcpListener;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sh(label: &str, script: &str) -> CommandTemplate {
    CommandTemplate {
        label: label.to_string(),
        interface_version: "test".to_string(),
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        flag_fallbacks: vec![],
    }
}

fn ctx(port: u16) -> LaunchContext {
    LaunchContext {
        engine_root: PathBuf::from("/nonexistent"),
        host: "127.0.0.1".to_string(),
        port,
        output_dir: PathBuf::from("/tmp/out"),
        model_root: PathBuf::from("/tmp/models"),
    }
}

fn options() -> LaunchOptions {
    LaunchOptions {
        launch_grace: Duration::from_millis(200),
        terminate_grace: Duration::from_millis(500),
    }
}

/// Reserve a loopback port that nothing is listening on.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_when_port_accepts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let mut server = ServerProcess::launch(&[sh("sleeper", "sleep 30")], &ctx(port), options())
        .await
        .expect("launch");
    assert_eq!(server.state(), ServerState::Starting);

    let deadline = Duration::from_secs(5);
    let elapsed = server
        .wait_until_ready(deadline, Duration::from_millis(50))
        .await
        .expect("ready");
    assert!(elapsed < deadline);
    assert_eq!(server.state(), ServerState::Ready);

    server.shutdown().await;
    assert_eq!(server.state(), ServerState::Terminated);
}

#[tokio::test]
async fn readiness_polls_until_port_opens() {
    let port = free_port().await;
    let opener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind late");
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(listener);
    });

    let mut server = ServerProcess::launch(&[sh("sleeper", "sleep 30")], &ctx(port), options())
        .await
        .expect("launch");
    let elapsed = server
        .wait_until_ready(Duration::from_secs(10), Duration::from_millis(50))
        .await
        .expect("ready");
    assert!(elapsed >= Duration::from_millis(100));
    server.shutdown().await;
    opener.abort();
}

#[tokio::test]
async fn crash_before_ready_is_reported_early() {
    let port = free_port().await;
    let script = "sleep 1; echo 'model load failed' >&2; exit 1";
    let mut server = ServerProcess::launch(&[sh("crasher", script)], &ctx(port), options())
        .await
        .expect("launch survives grace window");

    let start = Instant::now();
    let err = server
        .wait_until_ready(Duration::from_secs(60), Duration::from_millis(50))
        .await
        .expect_err("should crash");

    assert!(start.elapsed() < Duration::from_secs(15), "must not wait out the deadline");
    assert_matches!(
        &err,
        SupervisorError::Crashed { code: Some(1), stderr_tail, .. } if stderr_tail.contains("model load failed")
    );
    assert_eq!(server.state(), ServerState::Crashed);

    server.shutdown().await;
    assert_eq!(server.state(), ServerState::Terminated);
}

#[tokio::test]
async fn readiness_times_out_when_port_never_opens() {
    let port = free_port().await;
    let mut server = ServerProcess::launch(&[sh("sleeper", "sleep 30")], &ctx(port), options())
        .await
        .expect("launch");

    let start = Instant::now();
    let err = server
        .wait_until_ready(Duration::from_millis(400), Duration::from_millis(50))
        .await
        .expect_err("should time out");

    assert_matches!(err, SupervisorError::ReadinessTimeout { port: p, .. } if p == port);
    assert!(start.elapsed() < Duration::from_secs(3));
    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// Launch fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn immediate_exit_fails_launch_with_stderr() {
    let port = free_port().await;
    let result = ServerProcess::launch(
        &[sh("broken", "echo 'no module named torch' >&2; exit 1")],
        &ctx(port),
        options(),
    )
    .await;

    assert_matches!(
        result,
        Err(SupervisorError::NoCandidateStarted { attempts })
            if attempts.len() == 1 && attempts[0].contains("no module named torch")
    );
}

#[tokio::test]
async fn argument_error_retries_with_fallback_flag() {
    let port = free_port().await;
    // `$0` is the argument after the script: only the respelled flag survives.
    let mut template = sh(
        "versioned",
        "case \"$0\" in --output-dir) sleep 30;; *) echo \"unrecognized arguments: $0\" >&2; exit 2;; esac",
    );
    template.args.push("--output-directory".to_string());
    template.flag_fallbacks = vec![FlagFallback::new("--output-directory", "--output-dir")];

    let mut server = ServerProcess::launch(&[template], &ctx(port), options())
        .await
        .expect("fallback should start");

    assert!(server.label().contains("fallback flags"));
    server.shutdown().await;
}

#[tokio::test]
async fn next_candidate_after_failures() {
    let port = free_port().await;
    let candidates = [
        sh("argparse-error", "exit 2"),
        sh("missing-binary", "exit 127"),
        sh("working", "sleep 30"),
    ];

    let mut server = ServerProcess::launch(&candidates, &ctx(port), options())
        .await
        .expect("third candidate should start");

    assert_eq!(server.label(), "working");
    server.shutdown().await;
}

#[tokio::test]
async fn missing_program_is_a_failed_candidate() {
    let port = free_port().await;
    let mut missing = sh("ghost", "");
    missing.program = "/definitely/not/an/engine".to_string();

    let result = ServerProcess::launch(&[missing], &ctx(port), options()).await;
    assert_matches!(
        result,
        Err(SupervisorError::NoCandidateStarted { attempts }) if attempts[0].contains("failed to spawn")
    );

    let empty = ServerProcess::launch(&[], &ctx(port), options()).await;
    assert_matches!(empty, Err(SupervisorError::NoCandidates));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_kills_engine_that_ignores_terminate() {
    let port = free_port().await;
    let script = "trap '' TERM; while true; do sleep 0.1; done";
    let mut server = ServerProcess::launch(&[sh("stubborn", script)], &ctx(port), options())
        .await
        .expect("launch");

    let start = Instant::now();
    server.shutdown().await;

    assert_eq!(server.state(), ServerState::Terminated);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(server.pid().is_none(), "process should be reaped");

    // Idempotent.
    server.shutdown().await;
    assert_eq!(server.state(), ServerState::Terminated);
}

/// True once `pid` no longer exists or is only a zombie awaiting reaping.
#[cfg(target_os = "linux")]
fn process_gone(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn shutdown_reaches_processes_started_by_a_wrapper() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pidfile = dir.path().join("engine.pid");
    let port = free_port().await;
    let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
    let mut server = ServerProcess::launch(&[sh("wrapper", &script)], &ctx(port), options())
        .await
        .expect("launch");

    let mut engine_pid = String::new();
    for _ in 0..40 {
        engine_pid = std::fs::read_to_string(&pidfile).unwrap_or_default().trim().to_string();
        if !engine_pid.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!engine_pid.is_empty(), "wrapper never reported the engine pid");
    assert!(!process_gone(&engine_pid));

    server.shutdown().await;

    let mut gone = false;
    for _ in 0..40 {
        if process_gone(&engine_pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "engine started by the wrapper survived shutdown");
}

#[tokio::test]
async fn debug_output_names_the_candidate() {
    let port = free_port().await;
    let mut server = ServerProcess::launch(&[sh("sleeper", "sleep 30")], &ctx(port), options())
        .await
        .expect("launch");

    let rendered = format!("{server:?}");
    assert!(rendered.contains("sleeper"));
    assert!(rendered.contains(&port.to_string()));
    server.shutdown().await;
}
