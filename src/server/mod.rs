//! Recorder server: HTTP sink handler, listener composition, writer pool,
//! and shutdown coordination.

pub mod http;
pub mod recorder;
pub mod shutdown;
pub mod tls;

pub use http::{build_router, parse_serve_urls, run_listener, ListenerSpec, SinkState};
pub use recorder::{
    RecorderConfig, RecorderPool, ARCHIVE_EXTENSION, ARCHIVE_PREFIX, RECORD_CHANNEL_CAPACITY,
    ROTATE_INTERVAL, STATS_INTERVAL,
};
pub use shutdown::{wait_for_signal, ShutdownCoordinator};
pub use tls::load_tls_acceptor;
