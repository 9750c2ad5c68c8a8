#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # sinkhole
//!
//! Sinkhole is an HTTP sink-and-replay facility. The recorder terminates
//! arbitrary HTTP requests at high rate, answers 200 OK, and persists each
//! request (method, target URI, raw headers, body, and an identifier) into
//! rotated, optionally compressed archive files on a local filesystem or a
//! cloud object store. The replayer reads those archives back and reissues
//! the recorded requests against a different target host in parallel.
//!
//! ## Running the recorder
//!
//! ```bash
//! # Answer 200 to everything, record nothing
//! $ ./sinkhole
//!
//! # Record into rotated archives with compression and five workers
//! $ ./sinkhole -o /var/lib/sinkhole -c -t 5
//!
//! # Record straight to an object store
//! $ ./sinkhole -o s3://my-bucket/captures
//! ```
//!
//! ## Replaying
//!
//! ```bash
//! # Reissue everything against a staging host
//! $ ./sinkhole-replay -H staging.example.com:8080 requests_*.fbf
//!
//! # Inspect an archive without sending anything
//! $ ./sinkhole-replay -n requests_20240101120000_abcd.fbf
//! ```
//!
//! ## Architecture
//!
//! - [`record`]: the request-record codec, buffer pools, and the
//!   length-prefixed frame reader/writer with bounded tail-follow
//! - [`archive`]: the stage-then-finalize sink abstraction with local,
//!   S3-style, Azure-style, and checksum backends behind one URL format
//! - [`server`]: the HTTP handler, listener composition, the bounded
//!   record channel, the writer pool, and graceful shutdown
//! - [`replay`]: the archive reader, sender worker pool, pacing, and
//!   selective replay
//! - [`config`]: CLI arguments and the TOML configuration file
//! - [`error`]: error types and the `Result` alias

pub mod archive;
pub mod config;
pub mod error;
pub mod record;
pub mod replay;
pub mod server;

pub use error::{Result, SinkholeError};
