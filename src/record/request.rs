//! Captured-request records and their pooled encode/decode leases
//!
//! A [`RequestFrame`] is the unit of record: five byte strings, none of
//! which is required to be valid UTF-8. [`MarshalledRequest`] is a pooled
//! lease over the encoded form, produced on the capture side;
//! [`UnmarshalledRequest`] is a pooled read buffer filled by the archive
//! reader and decoded on the replay side.

use crate::error::{Result, SinkholeError};
use crate::record::pool::BytePool;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header carrying the URI to record instead of the request target
pub const ORIGINAL_URI_HEADER: &str = "x-original-uri";

/// Header carrying an externally supplied request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static BUILDER_POOL: BytePool = BytePool::new(2048);
static ID_SCRATCH_POOL: BytePool = BytePool::new(50);
static READ_POOL: BytePool = BytePool::new(2048);

/// A single captured HTTP request.
///
/// `id` is unique per emission: either the `X-Request-ID` header value or a
/// synthesized `FH-<unix-nanos>-<connection-id>` string. `headers` holds the
/// original header block as received, one `name: value` pair per CRLF line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: Bytes,
    pub method: Bytes,
    pub uri: Bytes,
    pub headers: Bytes,
    pub body: Bytes,
}

/// An encoded request ready to be framed into an archive.
///
/// Holds a buffer leased from a process-wide pool; dropping the value
/// returns the buffer. The lease is move-only, so a double release is
/// unrepresentable.
pub struct MarshalledRequest {
    data: Vec<u8>,
}

impl MarshalledRequest {
    /// Encode a frame into a pooled buffer.
    pub fn from_frame(frame: &RequestFrame) -> Result<Self> {
        let mut data = BUILDER_POOL.get();
        bincode::serialize_into(&mut data, frame)
            .map_err(|e| SinkholeError::codec_msg(format!("unable to encode request: {e}")))?;
        Ok(Self { data })
    }

    /// Encode a request from its five raw fields.
    pub fn from_parts(
        id: &[u8],
        method: &[u8],
        uri: &[u8],
        headers: &[u8],
        body: Bytes,
    ) -> Result<Self> {
        Self::from_frame(&RequestFrame {
            id: Bytes::copy_from_slice(id),
            method: Bytes::copy_from_slice(method),
            uri: Bytes::copy_from_slice(uri),
            headers: Bytes::copy_from_slice(headers),
            body,
        })
    }

    /// Build and encode a record from an incoming HTTP request.
    ///
    /// The recorded URI comes from `X-Original-URI` when present, otherwise
    /// from the request target. The id comes from `X-Request-ID` when
    /// present, otherwise `FH-<unix-nanos>-<connection-id>` is synthesized
    /// in a pooled scratch buffer.
    pub fn from_http_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        connection_id: u64,
    ) -> Result<Self> {
        let target;
        let recorded_uri: &[u8] = match headers.get(ORIGINAL_URI_HEADER) {
            Some(original) if !original.as_bytes().is_empty() => original.as_bytes(),
            _ => {
                target = uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_owned())
                    .unwrap_or_else(|| uri.path().to_owned());
                target.as_bytes()
            }
        };

        let raw_headers = raw_header_block(headers);

        match headers.get(REQUEST_ID_HEADER) {
            Some(id) if !id.as_bytes().is_empty() => Self::from_parts(
                id.as_bytes(),
                method.as_str().as_bytes(),
                recorded_uri,
                &raw_headers,
                body,
            ),
            _ => {
                let mut scratch = ID_SCRATCH_POOL.get();
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                let _ = write!(scratch, "FH-{nanos}-{connection_id}");
                let record = Self::from_parts(
                    &scratch,
                    method.as_str().as_bytes(),
                    recorded_uri,
                    &raw_headers,
                    body,
                );
                ID_SCRATCH_POOL.put(scratch);
                record
            }
        }
    }

    /// The encoded bytes, exposed only to be handed to an archive writer.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MarshalledRequest {
    fn drop(&mut self) {
        BUILDER_POOL.put(std::mem::take(&mut self.data));
    }
}

/// A request record freshly read from an archive.
///
/// Wraps a growable read buffer leased from a pool. The archive reader
/// calls [`grow`](Self::grow) and fills [`bytes_mut`](Self::bytes_mut);
/// [`request`](Self::request) then decodes a typed view. Dropping the value
/// returns the buffer to the pool.
pub struct UnmarshalledRequest {
    data: Vec<u8>,
    len: usize,
}

impl UnmarshalledRequest {
    /// Lease an empty read buffer from the pool.
    pub fn lease() -> Self {
        Self {
            data: READ_POOL.get(),
            len: 0,
        }
    }

    /// Ensure at least `n` bytes of addressable space and set the payload
    /// length to `n`.
    pub fn grow(&mut self, n: usize) {
        if self.data.len() < n {
            self.data.resize(n, 0);
        }
        self.len = n;
    }

    /// The payload region, for the reader to fill.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// The filled payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decode the payload into a typed record.
    pub fn request(&self) -> Result<RequestFrame> {
        bincode::deserialize(self.bytes())
            .map_err(|e| SinkholeError::codec_msg(format!("unable to decode request: {e}")))
    }
}

impl Drop for UnmarshalledRequest {
    fn drop(&mut self) {
        READ_POOL.put(std::mem::take(&mut self.data));
    }
}

/// Render a header map back into a raw `name: value` CRLF block.
pub fn raw_header_block(headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::with_capacity(256);
    for (name, value) in headers {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}
