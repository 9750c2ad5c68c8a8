//! Replay pipeline: a single archive reader feeding a pool of HTTP egress
//! workers, with dry-run, extraction, id filtering, pacing, and early exit.

pub mod driver;
pub mod worker;

pub use driver::{replay_file, ReplaySettings, READ_BUFFER_SIZE};
pub use worker::{SenderWorker, WorkerSignal};
