//! Length-prefixed frame codec for request archives
//!
//! On disk an archive is a sequence of `(u64 little-endian length, payload)`
//! pairs with no delimiters between frames. A clean end of input before the
//! next length prefix is end-of-stream; end of input anywhere else is a
//! corruption event.

use crate::archive::Archive;
use crate::error::{Result, SinkholeError};
use crate::record::request::{MarshalledRequest, UnmarshalledRequest};
use std::time::Duration;

/// Size of the little-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Retry limit for tail-follow reads (one retry per second, ~10 minutes)
pub const TAIL_FOLLOW_MAX_RETRIES: u32 = 600;

/// Sleep between tail-follow retries
pub const TAIL_FOLLOW_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a full-buffer read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer was filled completely.
    Complete,
    /// Input ended before the buffer was filled. `bytes_read` of zero means
    /// the stream ended cleanly on a frame boundary.
    EndOfStream { bytes_read: usize },
}

/// Write one frame (`u64_le` length followed by the payload) to the archive
/// and release the builder.
///
/// A partial write from the underlying archive is a hard error; callers
/// treat any error as fatal for the current archive. When `flush_now` is
/// set a flush is requested, which compressed sinks ignore.
pub async fn save_request(
    archive: &mut dyn Archive,
    request: MarshalledRequest,
    flush_now: bool,
) -> Result<()> {
    let payload = request.bytes();
    let prefix = (payload.len() as u64).to_le_bytes();

    write_all(archive, &prefix).await?;
    write_all(archive, payload).await?;

    if flush_now {
        archive.flush().await?;
    }
    Ok(())
}

async fn write_all(archive: &mut dyn Archive, buf: &[u8]) -> Result<()> {
    let n = archive.write(buf).await?;
    if n != buf.len() {
        return Err(SinkholeError::archive_msg(format!(
            "wrote only {} bytes, {} expected",
            n,
            buf.len()
        )));
    }
    Ok(())
}

/// Read the next frame from the archive into a pooled buffer.
///
/// Returns `Ok(None)` on a clean end-of-stream. End of input after the
/// length prefix has been read is promoted to a corruption error. The
/// caller owns the returned lease; dropping it returns the buffer.
///
/// `wait_for_data` turns end-of-input into "data may arrive later"
/// (see [`read_full`]) and is refused on compressed archives: a partial
/// compressed block cannot be interpreted as a partial logical record.
pub async fn get_next_request(
    archive: &mut dyn Archive,
    wait_for_data: bool,
) -> Result<Option<UnmarshalledRequest>> {
    if wait_for_data && archive.is_compressed() {
        return Err(SinkholeError::Config(
            "tail-follow reads are not supported over compressed archives".to_string(),
        ));
    }

    let mut size_buf = [0u8; LENGTH_PREFIX_LEN];
    match read_full(archive, &mut size_buf, wait_for_data).await? {
        ReadOutcome::EndOfStream { bytes_read: 0 } => return Ok(None),
        ReadOutcome::EndOfStream { bytes_read } => {
            return Err(SinkholeError::codec_msg(format!(
                "read only {bytes_read} bytes of length prefix, {LENGTH_PREFIX_LEN} expected"
            )));
        }
        ReadOutcome::Complete => {}
    }

    let payload_len = u64::from_le_bytes(size_buf) as usize;
    let mut record = UnmarshalledRequest::lease();
    record.grow(payload_len);

    match read_full(archive, record.bytes_mut(), wait_for_data).await? {
        ReadOutcome::Complete => Ok(Some(record)),
        ReadOutcome::EndOfStream { bytes_read } => Err(SinkholeError::codec_msg(format!(
            "read only {bytes_read} bytes of payload, {payload_len} expected"
        ))),
    }
}

/// Fill `buf` completely from the archive.
///
/// With `wait_for_data` set, an end of input sleeps one second and retries,
/// up to [`TAIL_FOLLOW_MAX_RETRIES`] times, before reporting end-of-stream.
/// This makes it possible to consume an archive that another process is
/// still writing, `tail -f` style. Any error other than end of input is
/// fatal and propagated.
pub async fn read_full(
    archive: &mut dyn Archive,
    buf: &mut [u8],
    wait_for_data: bool,
) -> Result<ReadOutcome> {
    let mut bytes_read = 0;
    let mut tries = 0u32;

    while bytes_read < buf.len() {
        let n = archive.read(&mut buf[bytes_read..]).await?;
        if n == 0 {
            if wait_for_data && tries < TAIL_FOLLOW_MAX_RETRIES {
                tries += 1;
                tokio::time::sleep(TAIL_FOLLOW_RETRY_INTERVAL).await;
                continue;
            }
            return Ok(ReadOutcome::EndOfStream { bytes_read });
        }
        bytes_read += n;
        tries = 0;
    }

    Ok(ReadOutcome::Complete)
}
