//! Replay driver
//!
//! Opens one archive at a time through the backend dispatcher, spawns the
//! sender pool, and streams frames into a rendezvous channel. A two-way
//! select keeps the driver responsive to worker exit signals while it is
//! blocked dispatching.

use crate::archive::{self, Archive};
use crate::config::ReplayArgs;
use crate::error::{Result, SinkholeError};
use crate::record::{get_next_request, LENGTH_PREFIX_LEN};
use crate::replay::worker::{SenderWorker, WorkerSignal};
use bytes::Bytes;
use tracing::{error, info};

/// Read buffer size for replayed archives
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The replay flag bag, shared read-only by the driver and every worker.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub target_host: String,
    /// Dispatch cap; zero means unlimited
    pub num_requests: u64,
    pub num_threads: usize,
    pub min_delay_ms: u64,
    pub dry_run: bool,
    pub extract_to_file: bool,
    /// Exact-match id filter; empty means replay everything
    pub req_id: String,
    pub quiet: bool,
    pub exit_on_first_error: bool,
    pub output_directory: String,
    pub test_integrity: bool,
}

impl ReplaySettings {
    pub fn from_args(args: &ReplayArgs) -> Self {
        Self {
            target_host: args.target_host_port.clone(),
            num_requests: args.num_requests,
            num_threads: args.num_threads,
            min_delay_ms: args.min_delay_ms,
            dry_run: args.dry_run,
            extract_to_file: args.extract_to_file,
            req_id: args.req_id.clone(),
            quiet: args.quiet,
            exit_on_first_error: args.exit_on_first_error,
            output_directory: args.output_directory.clone(),
            test_integrity: args.test_integrity,
        }
    }
}

/// Replay one archive. Returns the number of dispatched requests on a
/// clean end-of-stream or once an id filter found its match; corruption
/// and worker failure signals surface as errors after all workers have
/// been joined.
pub async fn replay_file(
    file: &str,
    settings: &ReplaySettings,
    client: &reqwest::Client,
) -> Result<u64> {
    let mut sink = archive::open(file, READ_BUFFER_SIZE).await?;

    // Rendezvous channel: a frame is handed directly to whichever worker
    // is free.
    let (req_tx, req_rx) = flume::bounded(0);
    // Capacity equals the worker count so every worker can signal exit
    // without blocking, even after the driver has left the select.
    let (signal_tx, signal_rx) = flume::bounded::<WorkerSignal>(settings.num_threads);

    let mut workers = Vec::with_capacity(settings.num_threads);
    for worker_id in 0..settings.num_threads {
        let worker = SenderWorker::new(worker_id, settings, client.clone());
        workers.push(tokio::spawn(worker.run(req_rx.clone(), signal_tx.clone())));
    }
    drop(req_rx);
    drop(signal_tx);

    let filter = Bytes::copy_from_slice(settings.req_id.as_bytes());

    let mut dispatched = 0u64;
    let mut bytes_read = 0u64;
    let mut failure: Option<SinkholeError> = None;

    loop {
        let record = match get_next_request(sink.as_mut(), false).await {
            Ok(None) => break, // clean end of stream
            Ok(Some(record)) => record,
            Err(e) => {
                let err = SinkholeError::Corrupted {
                    offset: bytes_read,
                    reason: e.to_string(),
                };
                // logged now in case something below stalls
                error!(file, error = %err, "stopping replay of corrupted archive");
                failure = Some(err);
                break;
            }
        };
        bytes_read += LENGTH_PREFIX_LEN as u64 + record.len() as u64;

        if settings.test_integrity {
            match record.request() {
                Ok(frame) => println!("ID: {}", String::from_utf8_lossy(&frame.id)),
                Err(e) => {
                    failure = Some(SinkholeError::Corrupted {
                        offset: bytes_read,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            continue;
        }

        // With an id filter, dispatch ends at the first matching frame so a
        // later frame carrying the same id can never be replayed as well.
        let matched = !filter.is_empty()
            && record
                .request()
                .map(|frame| frame.id == filter)
                .unwrap_or(false);

        tokio::select! {
            sent = req_tx.send_async(record) => {
                if sent.is_err() {
                    break; // every worker has exited
                }
                dispatched += 1;
                if matched {
                    info!(file, "id filter matched, stopping dispatch");
                    break;
                }
                if settings.num_requests > 0 && dispatched >= settings.num_requests {
                    info!(file, dispatched, "request cap reached");
                    break;
                }
            }
            signal = signal_rx.recv_async() => {
                match signal {
                    Ok(WorkerSignal::FilterMatched) => break,
                    Ok(WorkerSignal::Failed) | Err(_) => {
                        let err = SinkholeError::Replay(
                            "received exit signal from a worker".to_string(),
                        );
                        error!(file, error = %err, "stopping dispatch");
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
    }

    drop(req_tx);
    info!(file, "closing request channel, waiting for workers to finish");
    for handle in workers {
        let _ = handle.await;
    }
    sink.close().await?;
    info!(file, dispatched, "replay complete");

    match failure {
        Some(e) => Err(e),
        None => Ok(dispatched),
    }
}
