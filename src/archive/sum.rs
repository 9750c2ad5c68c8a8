//! Checksum archive backend
//!
//! A sink that never touches a file: every write feeds a rolling 64-bit
//! content hash, and close emits the hex digest as the synthetic finalized
//! name. Useful for validating that two capture runs produced identical
//! streams. Read, rotate, listing, and deletion are unsupported.

use crate::archive::common::ArchiveFileDetails;
use crate::archive::Archive;
use crate::error::{Result, SinkholeError};
use async_trait::async_trait;
use xxhash_rust::xxh64::Xxh64;

/// Archive backend accumulating a content checksum instead of a file.
pub struct ChecksumArchive {
    hasher: Xxh64,
    bytes_written: u64,
    chunks_written: u64,
    closed: bool,
    finalized: Vec<ArchiveFileDetails>,
}

impl ChecksumArchive {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(0),
            bytes_written: 0,
            chunks_written: 0,
            closed: false,
            finalized: Vec::new(),
        }
    }
}

impl Default for ChecksumArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Archive for ChecksumArchive {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(SinkholeError::archive_msg("checksum sink is closed"));
        }
        self.bytes_written += buf.len() as u64;
        self.chunks_written += 1;
        self.hasher.update(buf);
        Ok(buf.len())
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(SinkholeError::Unsupported(
            "read is not supported by the checksum sink",
        ))
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        Err(SinkholeError::Unsupported(
            "rotate is not supported by the checksum sink",
        ))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(SinkholeError::archive_msg("checksum sink is closed"));
        }
        self.closed = true;

        if self.bytes_written == 0 {
            return Ok(());
        }

        let digest = format!("{:016x}", self.hasher.digest());
        self.finalized.push(ArchiveFileDetails {
            // no real file exists; the digest doubles as the name
            file_name: digest.clone(),
            bytes_written: self.bytes_written,
            chunks_written: self.chunks_written,
            checksum: digest,
        });
        Ok(())
    }

    fn name(&self) -> String {
        "<checksum>".to_string()
    }

    fn finalized(&self) -> &[ArchiveFileDetails] {
        &self.finalized
    }
}
