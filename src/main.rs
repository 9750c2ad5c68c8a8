//! Sinkhole recorder daemon
//!
//! Terminates HTTP requests on every configured listener, answers 200, and
//! feeds the writer pool when an output destination is configured.

use clap::Parser;
use sinkhole::config::{ConfigFile, RecorderArgs};
use sinkhole::server::{
    build_router, load_tls_acceptor, parse_serve_urls, run_listener, wait_for_signal,
    RecorderConfig, RecorderPool, ShutdownCoordinator, SinkState,
};
use sinkhole::{Result, SinkholeError};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("sinkhole failed: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<()> {
    let args = RecorderArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let log_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter)
        .init();

    args.validate()?;

    // pin the process default TLS provider before any acceptor is built;
    // more than one provider feature is enabled in the dependency graph
    let _ = rustls::crypto::ring::default_provider().install_default();

    if args.profiling_requested() {
        // profiler wiring lives outside this binary
        warn!("profiling flags are recognized but handled by an external profiler");
    }

    let config = match &args.config {
        Some(path) => {
            let config = ConfigFile::load(path)?;
            info!(path = %path.display(), "loaded configuration");
            config
        }
        None => ConfigFile::load_default()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| SinkholeError::Server(format!("failed to create runtime: {e}")))?;

    runtime.block_on(run_recorder(args, config))
}

async fn run_recorder(args: RecorderArgs, config: ConfigFile) -> Result<()> {
    let acceptor = match &config.tls {
        Some(tls) => Some(load_tls_acceptor(tls)?),
        None => {
            info!("no TLS certificate configured");
            None
        }
    };
    let specs = parse_serve_urls(&config.serve, acceptor.is_some())?;

    let pool = if args.output_directory.is_empty() {
        info!("no output directory configured, requests will be answered and dropped");
        None
    } else {
        Some(
            RecorderPool::start(&RecorderConfig {
                output_url: args.output_directory.clone(),
                compress: args.compress,
                buffer_size: args.buffer_size,
                workers: args.recorder_threads,
                counter_only: args.counter_only,
                skip_stats: args.skip_stats,
            })
            .await?,
        )
    };

    let state = SinkState::new(pool.as_ref().map(|p| p.sender()));
    let router = build_router(state);

    let shutdown = Arc::new(ShutdownCoordinator::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.initiate();
        });
    }

    let mut listeners = tokio::task::JoinSet::new();
    for spec in specs {
        listeners.spawn(run_listener(
            spec,
            router.clone(),
            acceptor.clone(),
            shutdown.clone(),
        ));
    }
    drop(router);

    // Listener tasks return only after shutdown was initiated and their
    // connections drained; once they are all done, every handler-side
    // channel handle is gone. A listener failure (bad bind, accept loop
    // error) takes the whole process down through the same drain path.
    let mut listener_error = None;
    while let Some(joined) = listeners.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "listener failed");
                listener_error.get_or_insert(e);
                shutdown.initiate();
            }
            Err(e) => {
                error!(error = %e, "listener task panicked");
                listener_error
                    .get_or_insert(SinkholeError::Server(format!("listener panicked: {e}")));
                shutdown.initiate();
            }
        }
    }

    if let Some(pool) = pool {
        let total = pool.shutdown().await?;
        info!(total, "recording finished");
    }

    match listener_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
