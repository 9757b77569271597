//! CLI entry point for the encode pipeline daemon
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use encode_pipeline::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

/// Chunked transcoding daemon: probes, dispatches and reassembles encodes
#[derive(Parser, Debug)]
#[command(name = "encode-pipeline-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_logging(config: &Config) {
    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);
    tracing::info!(config = %args.config.display(), "encode pipeline daemon starting");

    let daemon_result = if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config).await
    } else {
        Daemon::with_config(config).await
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise daemon");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        bind = %daemon.config.server.bind,
        threads_per_job = daemon.concurrency_plan.threads_per_job,
        max_concurrent_jobs = daemon.concurrency_plan.max_concurrent_jobs,
        "serving API"
    );
    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon stopped");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
