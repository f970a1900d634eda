//! `renderpod-worker` -- serverless render job worker.
//!
//! Reads one JSON job per line on stdin and writes one JSON response per
//! line on stdout. Logs go to stderr. See
//! [`WorkerConfig::from_env`](renderpod_core::config::WorkerConfig::from_env)
//! for the environment variables.

use renderpod_cloud::remote_source_from_config;
use renderpod_core::config::WorkerConfig;
use renderpod_worker::diagnostics;
use renderpod_worker::handler::JobHandler;
use renderpod_worker::runtime;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "renderpod_worker=info,renderpod_comfyui=info,renderpod_cloud=info,renderpod_core=info,engine=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    diagnostics::log_boot(&config, |name| std::env::var_os(name).is_some());

    let source = remote_source_from_config(&config).await;
    let handler = JobHandler::new(config, source);

    let stdin = BufReader::new(tokio::io::stdin());
    match runtime::run(&handler, stdin, tokio::io::stdout()).await {
        Ok(handled) => tracing::info!(handled, "Input closed, worker exiting"),
        Err(e) => {
            tracing::error!(error = %e, "Job loop I/O failure");
            std::process::exit(1);
        }
    }
}
