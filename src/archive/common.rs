//! Shared staging-file machinery for archive backends
//!
//! `BasicArchive` owns the lifecycle every file-producing backend shares:
//! a temporary staging file, the transparent buffering/compression writer
//! chain, the byte counter used for the empty-archive optimization, and the
//! bookkeeping of finalized artifacts. Backends layer their own finalizer
//! (rename, upload, digest) on top.

use crate::error::{Result, SinkholeError};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File name suffix marking a compressed archive
pub const COMPRESSED_SUFFIX: &str = ".lz4";

/// File name suffix marking an unfinished staging file
pub const STAGING_SUFFIX: &str = ".tmp";

/// Details of one finalized archive artifact.
///
/// `checksum` is only populated by the checksum sink, where it doubles as
/// the synthetic file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFileDetails {
    pub file_name: String,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub checksum: String,
}

/// Writer chain over the staging file: raw file, optionally wrapped in a
/// buffered writer, optionally wrapped in an LZ4 frame encoder.
enum StagingWriter {
    Plain(File),
    Buffered(BufWriter<File>),
    Lz4(FrameEncoder<BufWriter<File>>),
    Lz4Plain(FrameEncoder<File>),
}

impl StagingWriter {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.write_all(buf),
            Self::Buffered(w) => w.write_all(buf),
            Self::Lz4(w) => w.write_all(buf),
            Self::Lz4Plain(w) => w.write_all(buf),
        }
    }

    /// Flush buffered data and sync the file. No-op under compression:
    /// a mid-stream flush would force an LZ4 block boundary that no reader
    /// contract accounts for.
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.sync_all(),
            Self::Buffered(w) => {
                w.flush()?;
                w.get_ref().sync_all()
            }
            Self::Lz4(_) | Self::Lz4Plain(_) => Ok(()),
        }
    }

    /// Finish the chain, closing the LZ4 frame and flushing buffers, and
    /// hand back the raw file.
    fn finish(self) -> Result<File> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Buffered(w) => into_file(w),
            Self::Lz4(w) => {
                let inner = w.finish().map_err(|e| {
                    SinkholeError::archive_msg(format!("unable to finish compressed stream: {e}"))
                })?;
                into_file(inner)
            }
            Self::Lz4Plain(w) => w.finish().map_err(|e| {
                SinkholeError::archive_msg(format!("unable to finish compressed stream: {e}"))
            }),
        }
    }

    fn is_compressed(&self) -> bool {
        matches!(self, Self::Lz4(_) | Self::Lz4Plain(_))
    }
}

fn into_file(mut w: BufWriter<File>) -> Result<File> {
    w.flush()?;
    w.into_inner().map_err(|e| SinkholeError::Io(e.into_error()))
}

/// Reader chain: raw file, optionally through an LZ4 frame decoder, with
/// the optional read buffer on the outside as the last wrapper.
enum StagingReader {
    Plain(File),
    Buffered(BufReader<File>),
    Lz4(FrameDecoder<File>),
    BufferedLz4(BufReader<FrameDecoder<File>>),
}

impl StagingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Buffered(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::BufferedLz4(r) => r.read(buf),
        }
    }

    fn is_compressed(&self) -> bool {
        matches!(self, Self::Lz4(_) | Self::BufferedLz4(_))
    }
}

/// Backend-agnostic archive state: staging file, writer/reader chain,
/// byte counters, and the finalized-artifact ledger.
pub struct BasicArchive {
    writing: bool,
    compress: bool,
    buffer_size: usize,
    staging_path: PathBuf,
    bytes_written: u64,
    chunks_written: u64,
    writer: Option<StagingWriter>,
    reader: Option<StagingReader>,
    delete_on_close: bool,
    finalized: Vec<ArchiveFileDetails>,
}

impl BasicArchive {
    /// Create write-side state. No staging file exists until
    /// [`open_staging`](Self::open_staging) runs.
    pub fn for_write(compress: bool, buffer_size: usize) -> Self {
        Self {
            writing: true,
            compress,
            buffer_size,
            staging_path: PathBuf::new(),
            bytes_written: 0,
            chunks_written: 0,
            writer: None,
            reader: None,
            delete_on_close: false,
            finalized: Vec::new(),
        }
    }

    /// Open read-side state over an existing file. A `.lz4` suffix selects
    /// the decompressor. `delete_on_close` is used for downloaded temp
    /// files that must not outlive the read.
    pub fn open_for_read(path: &Path, buffer_size: usize, delete_on_close: bool) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            SinkholeError::archive_msg(format!("unable to open file {}: {e}", path.display()))
        })?;

        let compressed = path
            .to_string_lossy()
            .to_lowercase()
            .ends_with(COMPRESSED_SUFFIX);

        let reader = match (buffer_size > 0, compressed) {
            (true, true) => StagingReader::BufferedLz4(BufReader::with_capacity(
                buffer_size,
                FrameDecoder::new(file),
            )),
            (true, false) => StagingReader::Buffered(BufReader::with_capacity(buffer_size, file)),
            (false, true) => StagingReader::Lz4(FrameDecoder::new(file)),
            (false, false) => StagingReader::Plain(file),
        };

        Ok(Self {
            writing: false,
            compress: compressed,
            buffer_size,
            staging_path: path.to_path_buf(),
            bytes_written: 0,
            chunks_written: 0,
            writer: None,
            reader: Some(reader),
            delete_on_close,
            finalized: Vec::new(),
        })
    }

    /// Create a fresh staging file `<prefix>_<YYYYMMDDhhmmss>_<random><ext>[.lz4].tmp`
    /// in `dir` (created if missing) and install the writer chain.
    pub fn open_staging(&mut self, dir: &Path, prefix: &str, extension: &str) -> Result<()> {
        if !self.writing {
            return Err(SinkholeError::archive_msg("archive is not open for write"));
        }
        if self.writer.is_some() {
            return Err(SinkholeError::archive_msg(
                "staging file already open; close or rotate first",
            ));
        }

        std::fs::create_dir_all(dir).map_err(|e| {
            SinkholeError::archive_msg(format!(
                "unable to create staging directory {}: {e}",
                dir.display()
            ))
        })?;

        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let mut suffix = String::from(extension);
        if self.compress {
            suffix.push_str(COMPRESSED_SUFFIX);
        }
        suffix.push_str(STAGING_SUFFIX);

        let staged = tempfile::Builder::new()
            .prefix(&format!("{prefix}_{timestamp}_"))
            .suffix(&suffix)
            .tempfile_in(dir)
            .map_err(|e| {
                SinkholeError::archive_msg(format!("unable to open staging file: {e}"))
            })?;
        let (file, path) = staged.keep().map_err(|e| {
            SinkholeError::archive_msg(format!("unable to persist staging file: {e}"))
        })?;

        if self.buffer_size > 0 {
            debug!(buffer_size = self.buffer_size, "buffered writes enabled");
        }
        if self.compress {
            debug!("compression enabled");
        }

        self.writer = Some(match (self.buffer_size > 0, self.compress) {
            (true, true) => StagingWriter::Lz4(FrameEncoder::new(BufWriter::with_capacity(
                self.buffer_size,
                file,
            ))),
            (true, false) => {
                StagingWriter::Buffered(BufWriter::with_capacity(self.buffer_size, file))
            }
            (false, true) => StagingWriter::Lz4Plain(FrameEncoder::new(file)),
            (false, false) => StagingWriter::Plain(file),
        });
        self.bytes_written = 0;
        self.chunks_written = 0;
        self.staging_path = path;

        info!(path = %self.staging_path.display(), "created staging file");
        Ok(())
    }

    /// Append bytes to the staging file through the writer chain.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writing {
            return Err(SinkholeError::archive_msg("archive is not open for write"));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkholeError::archive_msg("archive has no open staging file"))?;

        // Counted before delegating; a failed write below must not roll the
        // counter back, keeping the empty-archive check monotone.
        self.bytes_written += buf.len() as u64;
        self.chunks_written += 1;

        writer.write_all(buf).map_err(|e| {
            SinkholeError::archive_msg(format!(
                "write to {} failed: {e}",
                self.staging_path.display()
            ))
        })?;
        Ok(buf.len())
    }

    /// Read bytes through the reader chain.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.writing {
            return Err(SinkholeError::archive_msg("archive is not open for read"));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SinkholeError::archive_msg("archive is closed"))?;
        reader.read(buf).map_err(|e| {
            SinkholeError::archive_msg(format!(
                "read from {} failed: {e}",
                self.staging_path.display()
            ))
        })
    }

    /// Flush buffered data and sync to disk. A no-op on compressed sinks
    /// and on the read side.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush().map_err(|e| {
                SinkholeError::archive_msg(format!(
                    "flush of {} failed: {e}",
                    self.staging_path.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Close the write side of the staging file.
    ///
    /// Returns the staging path when the backend finalizer should run, or
    /// `None` when the file was empty and has been deleted instead. The
    /// byte counters stay valid until [`record_finalized`](Self::record_finalized).
    pub fn close_for_write(&mut self) -> Result<Option<PathBuf>> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| SinkholeError::archive_msg("archive has no open staging file"))?;

        let file = writer.finish()?;
        file.sync_all()?;
        drop(file);

        let staging = std::mem::take(&mut self.staging_path);
        if self.bytes_written == 0 {
            info!(path = %staging.display(), "deleting empty staging file");
            std::fs::remove_file(&staging).map_err(|e| {
                SinkholeError::archive_msg(format!(
                    "unable to delete empty staging file {}: {e}",
                    staging.display()
                ))
            })?;
            return Ok(None);
        }
        Ok(Some(staging))
    }

    /// Record a successful finalize and reset the per-file counters.
    pub fn record_finalized(&mut self, final_name: String) {
        self.finalized.push(ArchiveFileDetails {
            file_name: final_name,
            bytes_written: self.bytes_written,
            chunks_written: self.chunks_written,
            checksum: String::new(),
        });
        self.bytes_written = 0;
        self.chunks_written = 0;
    }

    /// Close the read side, unlinking the file when `delete_on_close` was
    /// requested at open time.
    pub fn close_for_read(&mut self) -> Result<()> {
        self.reader = None;
        if self.delete_on_close && !self.staging_path.as_os_str().is_empty() {
            let path = std::mem::take(&mut self.staging_path);
            debug!(path = %path.display(), "removing downloaded temp file");
            std::fs::remove_file(&path).map_err(|e| {
                SinkholeError::archive_msg(format!(
                    "unable to remove temp file {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Mark the sink invalid after a final close.
    pub fn invalidate(&mut self) {
        self.writing = false;
        self.writer = None;
        self.reader = None;
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn has_open_staging(&self) -> bool {
        self.writer.is_some()
    }

    pub fn is_compressed(&self) -> bool {
        match (&self.writer, &self.reader) {
            (Some(w), _) => w.is_compressed(),
            (_, Some(r)) => r.is_compressed(),
            _ => self.compress,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn finalized(&self) -> &[ArchiveFileDetails] {
        &self.finalized
    }
}

/// Drain upload progress updates from `rx`, logging forward progress in
/// megabyte-sized steps and calling out transfers that restarted. Exits
/// when the channel closes.
pub(crate) fn spawn_upload_progress_reporter(
    file_name: String,
    file_size: u64,
    mut rx: mpsc::UnboundedReceiver<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut total = 0u64;
        let mut last_logged = 0u64;
        while let Some(transferred) = rx.recv().await {
            if transferred > total {
                if transferred - last_logged > 1_000_000 {
                    let percent = (transferred as f64 * 100.0) / (file_size.max(1) as f64);
                    info!(
                        file = %file_name,
                        transferred,
                        file_size,
                        percent = %format_args!("{percent:2.02}"),
                        "upload progress"
                    );
                    last_logged = transferred;
                }
            } else {
                warn!(
                    file = %file_name,
                    from = total,
                    to = transferred,
                    "previous upload attempt failed, transfer restarted"
                );
            }
            total = transferred;
        }
    })
}
