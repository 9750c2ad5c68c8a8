//! Graceful shutdown coordination
//!
//! One coordinator is shared by every listener and connection. Shutdown is
//! cooperative: listeners stop accepting, in-flight connections are told to
//! drain, and only then does the caller close the record channel so the
//! writer workers can finish and finalize their archives.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-based shutdown notifier.
pub struct ShutdownCoordinator {
    notify_tx: broadcast::Sender<()>,
    initiated: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(16);
        Self {
            notify_tx,
            initiated: AtomicBool::new(false),
        }
    }

    /// Subscribe to the shutdown notification.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_tx.subscribe()
    }

    /// Initiate shutdown. Idempotent; only the first call notifies.
    pub fn initiate(&self) {
        if !self.initiated.swap(true, Ordering::SeqCst) {
            info!("shutdown initiated");
            let _ = self.notify_tx.send(());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "unable to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
            _ = term.recv() => info!("received terminate signal"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt signal");
    }
}
