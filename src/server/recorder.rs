//! Recorder worker pool
//!
//! N consumer workers drain the bounded record channel, each owning one
//! archive that rotates on a timer. A separate aggregator sums the
//! per-worker counters every few seconds. Shutdown is cooperative: dropping
//! the channel's send side lets every worker drain what is queued, close
//! its archive, and finalize.

use crate::archive::{self, Archive, ArchiveOptions};
use crate::error::{Result, SinkholeError};
use crate::record::{save_request, MarshalledRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

/// Capacity of the record channel between the HTTP handler and the writer
/// pool. When full, handlers block; there is no drop policy.
pub const RECORD_CHANNEL_CAPACITY: usize = 10_000;

/// How often each worker publishes its running count
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// How often each worker rotates its archive (if it has new requests)
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(600);

/// Staging file prefix for recorded archives
pub const ARCHIVE_PREFIX: &str = "requests";

/// Extension for recorded archives
pub const ARCHIVE_EXTENSION: &str = ".fbf";

/// Recorder pool configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Archive destination URL (local path, `s3://`, `az://`, `sum://`)
    pub output_url: String,
    pub compress: bool,
    pub buffer_size: usize,
    /// Number of consumer workers, each owning one archive
    pub workers: usize,
    /// Count requests without writing frames
    pub counter_only: bool,
    /// Suppress the aggregate statistics printer
    pub skip_stats: bool,
}

/// The running writer pool: channel send side, worker handles, and the
/// per-worker counters the aggregator reads.
pub struct RecorderPool {
    tx: flume::Sender<MarshalledRequest>,
    handles: Vec<JoinHandle<Result<()>>>,
    counters: Arc<Vec<AtomicU64>>,
    exit_tx: broadcast::Sender<()>,
    stats_handle: Option<JoinHandle<()>>,
}

impl RecorderPool {
    /// Create the archives and spawn the consumer workers. Archive creation
    /// happens up front so a bad destination is a startup error, not a
    /// worker death later.
    pub async fn start(config: &RecorderConfig) -> Result<Self> {
        let (tx, rx) = flume::bounded(RECORD_CHANNEL_CAPACITY);
        let counters: Arc<Vec<AtomicU64>> =
            Arc::new((0..config.workers).map(|_| AtomicU64::new(0)).collect());
        let (exit_tx, _) = broadcast::channel(1);

        let options = ArchiveOptions {
            compress: config.compress,
            buffer_size: config.buffer_size,
        };

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let sink = archive::create(&config.output_url, ARCHIVE_PREFIX, ARCHIVE_EXTENSION, options)
                .await
                .map_err(|e| {
                    SinkholeError::Server(format!(
                        "unable to create archive for worker {worker_id}: {e}"
                    ))
                })?;
            handles.push(tokio::spawn(consume(
                worker_id,
                sink,
                rx.clone(),
                counters.clone(),
                exit_tx.subscribe(),
                config.counter_only,
            )));
        }
        drop(rx);

        let stats_handle = (!config.skip_stats)
            .then(|| tokio::spawn(stats_printer(counters.clone(), exit_tx.subscribe())));

        Ok(Self {
            tx,
            handles,
            counters,
            exit_tx,
            stats_handle,
        })
    }

    /// A send handle for the HTTP handler state.
    pub fn sender(&self) -> flume::Sender<MarshalledRequest> {
        self.tx.clone()
    }

    /// Close the record channel, wait for every worker to drain and
    /// finalize, and return the total request count. The channel handle is
    /// dropped exactly once and never replaced: a closed channel releases
    /// waiting receivers, which is what lets the workers exit.
    pub async fn shutdown(self) -> Result<u64> {
        let RecorderPool {
            tx,
            handles,
            counters,
            exit_tx,
            stats_handle,
        } = self;

        drop(tx);
        info!("record channel closed, waiting for recorder workers to drain");

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "recorder worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "recorder worker panicked");
                    first_error
                        .get_or_insert(SinkholeError::Server(format!("worker panicked: {e}")));
                }
            }
        }

        let _ = exit_tx.send(());
        if let Some(handle) = stats_handle {
            let _ = handle.await;
        }

        let total = counters.iter().map(|c| c.load(Ordering::Acquire)).sum();
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(total, "all recorder workers finished");
                Ok(total)
            }
        }
    }
}

/// One consumer worker: owns one archive, multiplexes the exit signal, the
/// statistics tick, the rotation tick, and the record channel.
async fn consume(
    worker_id: usize,
    mut sink: Box<dyn Archive>,
    rx: flume::Receiver<MarshalledRequest>,
    counters: Arc<Vec<AtomicU64>>,
    mut exit: broadcast::Receiver<()>,
    counter_only: bool,
) -> Result<()> {
    let mut received = 0u64;
    let mut at_last_rotate = 0u64;
    let mut stats_tick = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
    let mut rotate_tick = interval_at(Instant::now() + ROTATE_INTERVAL, ROTATE_INTERVAL);

    loop {
        tokio::select! {
            _ = exit.recv() => {
                info!(worker_id, "worker got exit signal");
                break;
            }
            _ = stats_tick.tick() => {
                counters[worker_id].store(received, Ordering::Release);
                debug!(worker_id, received, "received requests");
            }
            _ = rotate_tick.tick() => {
                if received > at_last_rotate {
                    match sink.rotate().await {
                        Ok(()) => at_last_rotate = received,
                        // sinks without rotation (checksum) just keep going
                        Err(SinkholeError::Unsupported(_)) => at_last_rotate = received,
                        Err(e) => {
                            return Err(SinkholeError::Server(format!(
                                "worker {worker_id}: rotating {} failed: {e}",
                                sink.name()
                            )));
                        }
                    }
                }
            }
            message = rx.recv_async() => match message {
                Ok(record) => {
                    received += 1;
                    if !counter_only {
                        save_request(sink.as_mut(), record, false).await.map_err(|e| {
                            SinkholeError::Server(format!(
                                "worker {worker_id}: writing to {} failed: {e}",
                                sink.name()
                            ))
                        })?;
                    }
                }
                Err(_) => break, // channel closed and fully drained
            }
        }
    }

    counters[worker_id].store(received, Ordering::Release);
    sink.close().await.map_err(|e| {
        SinkholeError::Server(format!("worker {worker_id}: closing archive failed: {e}"))
    })?;
    info!(worker_id, received, "done recording");
    Ok(())
}

/// Sum the per-worker counters every tick and log the aggregate rate.
async fn stats_printer(counters: Arc<Vec<AtomicU64>>, mut exit: broadcast::Receiver<()>) {
    let mut tick = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
    let mut prior_total = 0u64;
    let mut prior_at = Instant::now();

    loop {
        tokio::select! {
            _ = exit.recv() => break,
            _ = tick.tick() => {
                let total: u64 = counters.iter().map(|c| c.load(Ordering::Acquire)).sum();
                info!(
                    interval = total - prior_total,
                    seconds = %format_args!("{:.2}", prior_at.elapsed().as_secs_f64()),
                    total,
                    "aggregate requests received"
                );
                prior_total = total;
                prior_at = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestFrame;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn test_record(id: &str) -> MarshalledRequest {
        MarshalledRequest::from_frame(&RequestFrame {
            id: Bytes::copy_from_slice(id.as_bytes()),
            method: Bytes::from_static(b"GET"),
            uri: Bytes::from_static(b"/"),
            headers: Bytes::new(),
            body: Bytes::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pool_drains_and_counts_on_shutdown() {
        let dir = tempdir().unwrap();
        let pool = RecorderPool::start(&RecorderConfig {
            output_url: dir.path().to_string_lossy().into_owned(),
            compress: false,
            buffer_size: 0,
            workers: 3,
            counter_only: false,
            skip_stats: true,
        })
        .await
        .unwrap();

        let tx = pool.sender();
        for i in 0..50 {
            tx.send_async(test_record(&format!("id-{i}"))).await.unwrap();
        }
        drop(tx);

        let total = pool.shutdown().await.unwrap();
        assert_eq!(total, 50);

        let staged = dir.path().join(ARCHIVE_PREFIX);
        let files = archive::list(staged.to_str().unwrap()).await.unwrap();
        assert!(!files.is_empty());
    }

    #[tokio::test]
    async fn test_counter_only_writes_nothing() {
        let dir = tempdir().unwrap();
        let pool = RecorderPool::start(&RecorderConfig {
            output_url: dir.path().to_string_lossy().into_owned(),
            compress: false,
            buffer_size: 0,
            workers: 2,
            counter_only: true,
            skip_stats: true,
        })
        .await
        .unwrap();

        let tx = pool.sender();
        for i in 0..10 {
            tx.send_async(test_record(&format!("id-{i}"))).await.unwrap();
        }
        drop(tx);

        let total = pool.shutdown().await.unwrap();
        assert_eq!(total, 10);

        // empty staging files were deleted, nothing was finalized
        let staged = dir.path().join(ARCHIVE_PREFIX);
        let files = archive::list(staged.to_str().unwrap()).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_bad_destination_is_startup_error() {
        let result = RecorderPool::start(&RecorderConfig {
            output_url: "gopher://nope".to_string(),
            compress: false,
            buffer_size: 0,
            workers: 1,
            counter_only: false,
            skip_stats: true,
        })
        .await;
        assert!(result.is_err());
    }
}
