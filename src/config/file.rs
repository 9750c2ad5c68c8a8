//! Configuration file support for the recorder
//!
//! The recorder reads a small TOML file naming the listening URLs and,
//! when any of them is `https`, the TLS key material:
//!
//! ```toml
//! # sinkhole.toml
//! serve = ["http://:8080", "https://collector.example.com:8443"]
//!
//! [tls]
//! cert = "/etc/sinkhole/server.pem"
//! privkey = "/etc/sinkhole/server-key.pem"
//! ```
//!
//! The file is searched in `/etc/sinkhole/`, `$HOME/.sinkhole/`, and the
//! working directory, in that order.

use crate::error::{Result, SinkholeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the configuration file
pub const CONFIG_FILE_NAME: &str = "sinkhole.toml";

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Listening URLs; the scheme selects plain or TLS, the port defaults
    /// to 80/443 and may be overridden in the URL
    pub serve: Vec<String>,

    /// TLS key material, required for any `https` entry in `serve`
    pub tls: Option<TlsSection>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            serve: vec!["http://:80".to_string()],
            tls: None,
        }
    }
}

/// TLS section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    /// Certificate chain PEM file
    pub cert: PathBuf,
    /// Private key PEM file
    pub privkey: PathBuf,
}

impl ConfigFile {
    /// Load configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SinkholeError::Config(format!(
                "unable to read config file {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&raw).map_err(|e| {
            SinkholeError::Config(format!("config file {} is malformed: {e}", path.display()))
        })
    }

    /// Load configuration from the default search locations, falling back
    /// to built-in defaults when no file exists. A file that exists but
    /// fails to parse is an error, not a fallback.
    pub fn load_default() -> Result<Self> {
        for dir in Self::search_paths() {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                let config = Self::load(&candidate)?;
                info!(path = %candidate.display(), "loaded configuration");
                return Ok(config);
            }
        }
        info!(
            "no config file ({CONFIG_FILE_NAME}) found in /etc/sinkhole/, $HOME/.sinkhole, \
             or the working directory; using defaults"
        );
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/sinkhole")];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".sinkhole"));
        }
        paths.push(PathBuf::from("."));
        paths
    }
}
