//! Sinkhole replay tool
//!
//! Replays archives of recorded requests against a different target host.
//! Archives must have been produced by the sinkhole recorder.

use clap::Parser;
use sinkhole::config::ReplayArgs;
use sinkhole::replay::{replay_file, ReplaySettings};
use sinkhole::{Result, SinkholeError};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keep-alive connections retained per target host
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 100;

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("sinkhole-replay failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let mut args = ReplayArgs::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter)
        .init();

    args.normalize_and_validate()?;

    // pin the process default TLS provider before the client is built;
    // more than one provider feature is enabled in the dependency graph
    let _ = rustls::crypto::ring::default_provider().install_default();

    if args.profiling_requested() {
        // profiler wiring lives outside this binary
        warn!("profiling flags are recognized but handled by an external profiler");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| SinkholeError::Replay(format!("failed to create runtime: {e}")))?;

    runtime.block_on(run_replay(args))
}

async fn run_replay(args: ReplayArgs) -> Result<()> {
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
        .build()
        .map_err(|e| SinkholeError::Replay(format!("failed to create HTTP client: {e}")))?;

    let settings = ReplaySettings::from_args(&args);

    let mut failures = 0usize;
    for file in &args.files {
        match replay_file(file, &settings, &client).await {
            Ok(dispatched) => info!(file = %file, dispatched, "finished replaying archive"),
            Err(e) => {
                error!(file = %file, error = %e, "replaying archive failed");
                if settings.exit_on_first_error {
                    return Err(e);
                }
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(SinkholeError::Replay(format!(
            "{failures} of {} archive(s) failed",
            args.files.len()
        )));
    }
    Ok(())
}
