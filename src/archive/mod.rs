//! Archive sinks for captured request frames
//!
//! An archive is an append-only file of framed records plus the machinery
//! that stages, finalizes, and optionally transports it. All destinations
//! share one URL format:
//!
//! - `file:///path/to/directory` (or any plain path) writes local files,
//! - `s3://bucket/path/inside` uploads to an S3-style object store,
//! - `az://container/path/inside` uploads to an Azure-style blob store,
//! - `sum://` accumulates a content checksum and produces no file.
//!
//! The scheme resolves to a backend at construction time; after that every
//! sink speaks the same small [`Archive`] interface.

pub mod common;
pub mod file;
pub mod object;
pub mod sum;

pub use common::{ArchiveFileDetails, BasicArchive, COMPRESSED_SUFFIX, STAGING_SUFFIX};
pub use file::FileArchive;
pub use object::ObjectArchive;
pub use sum::ChecksumArchive;

use crate::error::{Result, SinkholeError};
use async_trait::async_trait;

/// Options shared by every write-side archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Wrap the staging file in a streaming LZ4 compressor
    pub compress: bool,
    /// Buffered-writer size in bytes; zero means unbuffered
    pub buffer_size: usize,
}

/// The archive capability: a stage-then-finalize sink for framed records.
///
/// Writes are legal only between open/rotate and close. `rotate` finalizes
/// the current staging file and opens a fresh one; `close` finalizes and
/// invalidates the sink. A finalized name is published only after the
/// corresponding staging artifact was fully flushed and closed, and a
/// zero-byte file never produces one.
#[async_trait]
pub trait Archive: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn flush(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn rotate(&mut self) -> Result<()>;

    /// Current staging identifier, for logging.
    fn name(&self) -> String;

    /// Whether a compressor sits in the read or write chain. Tail-follow
    /// reads must be refused when this is true.
    fn is_compressed(&self) -> bool {
        false
    }

    /// Artifacts finalized so far, in finalize order.
    fn finalized(&self) -> &[ArchiveFileDetails];
}

fn scheme_of(location: &str) -> String {
    match location.find("://") {
        None => "file".to_string(),
        Some(idx) => {
            let scheme = location[..idx].to_ascii_lowercase();
            if scheme == "file" {
                "file".to_string()
            } else {
                scheme
            }
        }
    }
}

pub(crate) fn strip_file_scheme(location: &str) -> &str {
    location.strip_prefix("file://").unwrap_or(location)
}

/// Open an archive for writing at `out_url`, dispatching by URL scheme.
/// Once rotated, new writes go to a new staging file.
pub async fn create(
    out_url: &str,
    prefix: &str,
    extension: &str,
    options: ArchiveOptions,
) -> Result<Box<dyn Archive>> {
    match scheme_of(out_url).as_str() {
        "file" => Ok(Box::new(
            FileArchive::create(out_url, prefix, extension, options).await?,
        )),
        "s3" | "az" => Ok(Box::new(
            ObjectArchive::create(out_url, prefix, extension, options).await?,
        )),
        "sum" => Ok(Box::new(ChecksumArchive::new())),
        other => Err(SinkholeError::Config(format!(
            "unsupported archive URL scheme '{other}://' in {out_url}"
        ))),
    }
}

/// Open a single archive for reading, dispatching by URL scheme. Remote
/// archives are downloaded to a temp file that is removed on close.
pub async fn open(location: &str, buffer_size: usize) -> Result<Box<dyn Archive>> {
    match scheme_of(location).as_str() {
        "file" => Ok(Box::new(FileArchive::open(location, buffer_size).await?)),
        "s3" | "az" => Ok(Box::new(ObjectArchive::open(location, buffer_size).await?)),
        "sum" => Err(SinkholeError::Unsupported(
            "read is not supported by the checksum sink",
        )),
        other => Err(SinkholeError::Config(format!(
            "unsupported archive URL scheme '{other}://' in {location}"
        ))),
    }
}

/// List archive names under `root`, dispatching by URL scheme.
pub async fn list(root: &str) -> Result<Vec<String>> {
    match scheme_of(root).as_str() {
        "file" => file::list(root),
        "s3" | "az" => object::list(root).await,
        "sum" => Err(SinkholeError::Unsupported(
            "list is not supported by the checksum sink",
        )),
        other => Err(SinkholeError::Config(format!(
            "unsupported archive URL scheme '{other}://' in {root}"
        ))),
    }
}

/// Delete the named archives under `root`, dispatching by URL scheme.
pub async fn delete(root: &str, names: &[String]) -> Result<()> {
    match scheme_of(root).as_str() {
        "file" => file::delete(root, names),
        "s3" | "az" => object::delete(root, names).await,
        "sum" => Err(SinkholeError::Unsupported(
            "delete is not supported by the checksum sink",
        )),
        other => Err(SinkholeError::Config(format!(
            "unsupported archive URL scheme '{other}://' in {root}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_dispatch() {
        assert_eq!(scheme_of("/var/data/requests"), "file");
        assert_eq!(scheme_of("file:///var/data"), "file");
        assert_eq!(scheme_of("s3://bucket/prefix"), "s3");
        assert_eq!(scheme_of("AZ://container/prefix"), "az");
        assert_eq!(scheme_of("sum://anything"), "sum");
    }

    #[test]
    fn test_strip_file_scheme() {
        assert_eq!(strip_file_scheme("file:///var/data"), "/var/data");
        assert_eq!(strip_file_scheme("/var/data"), "/var/data");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_config_error() {
        let result = create("gopher://hole/prefix", "requests", ".fbf", Default::default()).await;
        assert!(matches!(result, Err(SinkholeError::Config(_))));
    }
}
