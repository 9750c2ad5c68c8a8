//! Command-line arguments for the recorder and replay binaries
//!
//! Defined with clap derive. Validation beyond what clap expresses lives in
//! the `validate` methods and runs before anything else starts.

use crate::error::{Result, SinkholeError};
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the recorder daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "sinkhole")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HTTP endpoint that answers 200 to everything and records requests into replayable archives")]
pub struct RecorderArgs {
    /// Output directory or archive URL for saved requests
    /// (file path, s3://bucket/prefix, az://container/prefix, sum://).
    /// Empty disables persistence; the endpoint still answers 200.
    #[arg(short = 'o', long, default_value = "")]
    pub output_directory: String,

    /// Compress output (or not)
    #[arg(short = 'c', long)]
    pub compress: bool,

    /// Write buffer size in bytes (0 - default, unbuffered)
    #[arg(short = 'b', long, default_value_t = 0)]
    pub buffer_size: usize,

    /// Number of recorder threads
    #[arg(short = 't', long, default_value_t = 5)]
    pub recorder_threads: usize,

    /// Skip the aggregate statistics printer.
    /// Only valid when persistence is disabled.
    #[arg(long)]
    pub skip_stats: bool,

    /// Count requests without writing frames to the archive
    #[arg(long)]
    pub counter_only: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// (for debug only) CPU profile this run
    #[arg(long)]
    pub cpu_profile: bool,

    /// (for debug only) MEM profile this run
    #[arg(long)]
    pub mem_profile: bool,

    /// (for debug only) Mutex profile this run
    #[arg(long)]
    pub mutex_profile: bool,

    /// (for debug only) Block profile this run
    #[arg(long)]
    pub block_profile: bool,

    /// Path to configuration file (TOML). If not specified, looks for
    /// sinkhole.toml in /etc/sinkhole/, ~/.sinkhole/, or the working
    /// directory.
    #[arg(long, env = "SINKHOLE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl RecorderArgs {
    pub fn validate(&self) -> Result<()> {
        if self.recorder_threads == 0 {
            return Err(SinkholeError::Config(
                "--recorder-threads must be at least 1".to_string(),
            ));
        }
        if self.skip_stats && !self.output_directory.is_empty() {
            return Err(SinkholeError::Config(
                "--skip-stats is only valid when persistence is disabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn profiling_requested(&self) -> bool {
        self.cpu_profile || self.mem_profile || self.mutex_profile || self.block_profile
    }
}

/// Command-line arguments for the replay tool
#[derive(Parser, Debug, Clone)]
#[command(name = "sinkhole-replay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Replay an archive of recorded requests against a different target host")]
pub struct ReplayArgs {
    /// Send requests to this host. Example: localhost, localhost:8080,
    /// host.domain.com
    #[arg(short = 'H', long = "target-host-port", default_value = "")]
    pub target_host_port: String,

    /// Send only N requests (instead of everything from the file). 0 means
    /// unlimited.
    #[arg(short = 'r', long = "reqs", default_value_t = 0)]
    pub num_requests: u64,

    /// Number of request threads (parallel)
    #[arg(short = 't', long = "threads", default_value_t = 5)]
    pub num_threads: usize,

    /// Unpack and show what is in this file, don't run it
    #[arg(short = 'n', long = "dryrun")]
    pub dry_run: bool,

    /// Extract requests to one file per request. Please use this only with
    /// -r limit or -i options
    #[arg(short = 'f', long = "extract-to-file")]
    pub extract_to_file: bool,

    /// Run only the request with this exact id (do a dryrun first to see
    /// the ids)
    #[arg(short = 'i', long = "reqid", default_value = "")]
    pub req_id: String,

    /// Minimum time in milliseconds to wait before the next request is
    /// sent. 0 means no wait. Actual wait will be max(min-delay,
    /// actual-delay)
    #[arg(short = 'm', long = "min-delay", default_value_t = 0)]
    pub min_delay_ms: u64,

    /// Exit on first error
    #[arg(short = 'x', long = "exit-on-error")]
    pub exit_on_first_error: bool,

    /// Run quietly and print only errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Output directory if -f is used
    #[arg(short = 'o', long = "output-directory", default_value = ".")]
    pub output_directory: String,

    /// Test integrity of the file. Print the id of each request.
    #[arg(long = "test")]
    pub test_integrity: bool,

    /// (for debug only) CPU profile this run
    #[arg(long)]
    pub cpu_profile: bool,

    /// (for debug only) MEM profile this run
    #[arg(long)]
    pub mem_profile: bool,

    /// (for debug only) Mutex profile this run
    #[arg(long)]
    pub mutex_profile: bool,

    /// (for debug only) Block profile this run
    #[arg(long)]
    pub block_profile: bool,

    /// Archive files to replay
    #[arg(required = true)]
    pub files: Vec<String>,
}

impl ReplayArgs {
    /// Apply flag implications and reject inconsistent combinations.
    pub fn normalize_and_validate(&mut self) -> Result<()> {
        if self.extract_to_file {
            self.dry_run = true;
        }
        if self.num_threads == 0 {
            return Err(SinkholeError::Config(
                "--threads must be at least 1".to_string(),
            ));
        }
        if !self.dry_run && !self.test_integrity && self.target_host_port.is_empty() {
            return Err(SinkholeError::Config(
                "please supply a --target-host-port (unless you are doing a dryrun)".to_string(),
            ));
        }
        if self.extract_to_file && self.num_requests == 0 && self.req_id.is_empty() {
            return Err(SinkholeError::Config(
                "please supply a -r or -i option with --extract-to-file, \
                 otherwise the filesystem will be flooded"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn profiling_requested(&self) -> bool {
        self.cpu_profile || self.mem_profile || self.mutex_profile || self.block_profile
    }
}
