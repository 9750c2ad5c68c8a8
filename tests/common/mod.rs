//! Shared fixtures for sinkhole integration tests
//!
//! In a test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use bytes::Bytes;
use sinkhole::archive::{self, Archive, ArchiveOptions};
use sinkhole::record::{get_next_request, save_request, MarshalledRequest, RequestFrame};
use std::net::TcpListener;
use std::time::Duration;

/// Find an available TCP port for testing.
///
/// Binds to port 0 and returns the OS-assigned port. The port is released
/// when the function returns, so there's a small window where another
/// process could claim it.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    listener
        .local_addr()
        .expect("failed to get local address")
        .port()
}

/// Poll a TCP port until a connection succeeds or the timeout is reached.
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    let addr = format!("127.0.0.1:{port}");
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Directory where local archives written with the "requests" prefix land.
pub fn staged_dir(root: &std::path::Path) -> std::path::PathBuf {
    root.join("requests")
}

/// Build a request frame from string parts.
pub fn frame(id: &str, method: &str, uri: &str, headers: &[u8], body: &[u8]) -> RequestFrame {
    RequestFrame {
        id: Bytes::copy_from_slice(id.as_bytes()),
        method: Bytes::copy_from_slice(method.as_bytes()),
        uri: Bytes::copy_from_slice(uri.as_bytes()),
        headers: Bytes::copy_from_slice(headers),
        body: Bytes::copy_from_slice(body),
    }
}

/// Write the given frames into a fresh archive at `out_url` and return the
/// finalized file names.
pub async fn write_archive(
    out_url: &str,
    frames: &[RequestFrame],
    options: ArchiveOptions,
) -> Vec<String> {
    let mut sink = archive::create(out_url, "requests", ".fbf", options)
        .await
        .expect("create archive");
    for f in frames {
        let record = MarshalledRequest::from_frame(f).expect("encode frame");
        save_request(sink.as_mut(), record, false)
            .await
            .expect("save frame");
    }
    sink.close().await.expect("close archive");
    sink.finalized()
        .iter()
        .map(|d| d.file_name.clone())
        .collect()
}

/// Read every frame from an archive file.
pub async fn read_archive(path: &str) -> Vec<RequestFrame> {
    let mut sink = archive::open(path, 65536).await.expect("open archive");
    let mut frames = Vec::new();
    while let Some(record) = get_next_request(sink.as_mut(), false)
        .await
        .expect("read frame")
    {
        frames.push(record.request().expect("decode frame"));
    }
    sink.close().await.expect("close archive");
    frames
}
