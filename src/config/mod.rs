//! Configuration for the recorder and replay binaries
//!
//! - `args` - CLI argument definitions (clap)
//! - `file` - TOML configuration file with the `serve` list and TLS keys

mod args;
pub mod file;

pub use args::{RecorderArgs, ReplayArgs};
pub use file::{ConfigFile, TlsSection, CONFIG_FILE_NAME};
