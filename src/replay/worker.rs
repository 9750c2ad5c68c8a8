//! Replay sender worker
//!
//! Workers consume decoded records from the request channel until it
//! closes. One worker has at most one outstanding HTTP request; parallelism
//! is controlled entirely by how many workers the driver spawns. The
//! signal channel is sized to the worker count by the driver so every
//! worker can announce why it stopped without blocking.

use crate::error::{Result, SinkholeError};
use crate::record::{RequestFrame, UnmarshalledRequest};
use crate::replay::driver::ReplaySettings;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why a worker stopped before the request channel closed.
///
/// Completing the single id-filter match is a clean shutdown; only a fatal
/// outcome under exit-on-first-error makes the whole replay fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// A request failed and exit-on-first-error is set
    Failed,
    /// The id-filter match was replayed; nothing more to do
    FilterMatched,
}

/// One HTTP egress worker with its private replay state.
pub struct SenderWorker {
    worker_id: usize,
    target_host: String,
    client: reqwest::Client,
    dry_run: bool,
    extract_to_file: bool,
    quiet: bool,
    req_id: Bytes,
    min_delay: Duration,
    exit_on_first_error: bool,
    output_dir: PathBuf,
    url_buf: Vec<u8>,
    warned_slow: bool,
}

impl SenderWorker {
    pub fn new(worker_id: usize, settings: &ReplaySettings, client: reqwest::Client) -> Self {
        Self {
            worker_id,
            target_host: settings.target_host.clone(),
            client,
            dry_run: settings.dry_run,
            extract_to_file: settings.extract_to_file,
            quiet: settings.quiet,
            req_id: Bytes::copy_from_slice(settings.req_id.as_bytes()),
            min_delay: Duration::from_millis(settings.min_delay_ms),
            exit_on_first_error: settings.exit_on_first_error,
            output_dir: PathBuf::from(&settings.output_directory),
            url_buf: Vec::with_capacity(1024),
            warned_slow: false,
        }
    }

    /// Consume records until the channel closes. Stopping early (a fatal
    /// outcome under exit-on-first-error, or the single id-filter match)
    /// pushes the reason into the signal channel and exits the worker.
    pub async fn run(
        mut self,
        rx: flume::Receiver<UnmarshalledRequest>,
        signal_tx: flume::Sender<WorkerSignal>,
    ) {
        while let Ok(record) = rx.recv_async().await {
            let started = Instant::now();
            match self.process(record).await {
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "unexpected response from target");
                    if self.exit_on_first_error {
                        let _ = signal_tx.send_async(WorkerSignal::Failed).await;
                        break;
                    }
                }
                Ok(matched) => {
                    if self.min_delay > Duration::ZERO {
                        let elapsed = started.elapsed();
                        if elapsed < self.min_delay {
                            tokio::time::sleep(self.min_delay - elapsed).await;
                        } else if !self.warned_slow && elapsed > self.min_delay * 2 {
                            self.warned_slow = true;
                            warn!(
                                worker = self.worker_id,
                                actual_ms = elapsed.as_millis() as u64,
                                expected_ms = self.min_delay.as_millis() as u64,
                                "actual delay is well above the configured minimum"
                            );
                        }
                    }
                    if matched && !self.req_id.is_empty() {
                        let _ = signal_tx.send_async(WorkerSignal::FilterMatched).await;
                        break;
                    }
                }
            }
        }
    }

    /// Decode one record and replay it if the id filter allows. The pooled
    /// read buffer is released when `record` drops, on every path.
    async fn process(&mut self, record: UnmarshalledRequest) -> Result<bool> {
        let frame = record.request()?;

        if self.req_id.is_empty() || frame.id == self.req_id {
            if !self.quiet {
                debug!(
                    worker = self.worker_id,
                    id = %String::from_utf8_lossy(&frame.id),
                    uri = %String::from_utf8_lossy(&frame.uri),
                    "replaying request"
                );
            }
            self.replay(&frame).await?;
            Ok(true)
        } else {
            if !self.quiet {
                debug!(
                    worker = self.worker_id,
                    id = %String::from_utf8_lossy(&frame.id),
                    "skipping request"
                );
            }
            Ok(false)
        }
    }

    async fn replay(&mut self, frame: &RequestFrame) -> Result<()> {
        if !self.dry_run {
            self.send(frame).await
        } else if self.extract_to_file {
            self.extract(frame)
        } else {
            self.print(frame)
        }
    }

    /// Issue the recorded request against the target host. The outbound URL
    /// is `http://` + host + recorded URI, concatenated in a reusable
    /// buffer without re-parsing the recorded target.
    async fn send(&mut self, frame: &RequestFrame) -> Result<()> {
        self.url_buf.clear();
        self.url_buf.extend_from_slice(b"http://");
        self.url_buf.extend_from_slice(self.target_host.as_bytes());
        self.url_buf.extend_from_slice(&frame.uri);
        let url = std::str::from_utf8(&self.url_buf).map_err(|e| {
            SinkholeError::Replay(format!("recorded uri is not a valid request target: {e}"))
        })?;

        let method = reqwest::Method::from_bytes(&frame.method)
            .map_err(|e| SinkholeError::Replay(format!("invalid recorded method: {e}")))?;
        let headers = parse_raw_headers(&frame.headers)?;

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(frame.body.clone())
            .send()
            .await
            .map_err(|e| SinkholeError::Replay(format!("proxy request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SinkholeError::Replay(format!(
                "target returned {}",
                response.status()
            )));
        }
        let _ = response.bytes().await; // response body is discarded

        Ok(())
    }

    /// Write the request to a header file and a separate body file in the
    /// output directory. Separate files keep binary bodies intact.
    fn extract(&self, frame: &RequestFrame) -> Result<()> {
        let staged = tempfile::Builder::new()
            .prefix("request_header_")
            .tempfile_in(&self.output_dir)
            .map_err(|e| {
                SinkholeError::Replay(format!("unable to create output file for header: {e}"))
            })?;
        let (mut header_file, header_path) = staged.keep().map_err(|e| {
            SinkholeError::Replay(format!("unable to persist output file for header: {e}"))
        })?;

        header_file.write_all(&frame.method)?;
        header_file.write_all(b" ")?;
        header_file.write_all(&frame.uri)?;
        header_file.write_all(b"\n")?;
        header_file.write_all(&frame.headers)?;
        drop(header_file);

        let body_path = header_path
            .to_string_lossy()
            .replacen("_header_", "_body_", 1);
        std::fs::write(&body_path, &frame.body)?;

        info!(
            header = %header_path.display(),
            body = %body_path,
            "request saved"
        );
        Ok(())
    }

    /// Print the request to standard output.
    fn print(&self, frame: &RequestFrame) -> Result<()> {
        let mut out = std::io::stdout().lock();
        out.write_all(&frame.method)?;
        out.write_all(b" ")?;
        out.write_all(&frame.uri)?;
        out.write_all(b"\n")?;
        out.write_all(&frame.headers)?;
        out.write_all(&frame.body)?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// Parse a recorded raw header block back into a header map.
///
/// Content-Length and Transfer-Encoding are dropped: the client derives
/// message framing from the body it is given, and the stored values would
/// conflict with it.
fn parse_raw_headers(raw: &[u8]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in raw.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line.iter().position(|b| *b == b':').ok_or_else(|| {
            SinkholeError::Replay(format!(
                "malformed header line: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let (name, rest) = line.split_at(colon);
        let value = rest[1..]
            .iter()
            .position(|b| *b != b' ' && *b != b'\t')
            .map(|start| &rest[1 + start..])
            .unwrap_or(&[]);

        let name = HeaderName::from_bytes(name).map_err(|e| {
            SinkholeError::Replay(format!("failed to assemble outgoing header: {e}"))
        })?;
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        let value = HeaderValue::from_bytes(value).map_err(|e| {
            SinkholeError::Replay(format!("failed to assemble outgoing header: {e}"))
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}
