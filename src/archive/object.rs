//! Object-store archive backend (S3-style and Azure-blob-style)
//!
//! Writes stage into the system temp directory and upload on close; reads
//! download into a unique temp file first and then behave like a local
//! archive with `delete_on_close`. Store clients are constructed once per
//! bucket/container under a process-wide lock and shared by every sink.
//!
//! Credentials: the S3-style backend uses the SDK environment/default
//! chain; the Azure-style backend requires `AZURE_STORAGE_ACCOUNT` and
//! `AZURE_STORAGE_ACCESS_KEY`.

use crate::archive::common::{
    spawn_upload_progress_reporter, ArchiveFileDetails, BasicArchive, STAGING_SUFFIX,
};
use crate::archive::{Archive, ArchiveOptions};
use crate::error::{Result, SinkholeError};
use async_trait::async_trait;
use futures_util::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Upload block size (one multipart part per block)
const UPLOAD_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Maximum in-flight upload blocks
const UPLOAD_PARALLELISM: usize = 4;

/// Store clients, one per (scheme, container), built once under the lock
/// and read-only afterwards.
static OBJECT_SESSIONS: Mutex<BTreeMap<(String, String), Arc<dyn ObjectStore>>> =
    Mutex::new(BTreeMap::new());

fn object_session(scheme: &str, container: &str) -> Result<Arc<dyn ObjectStore>> {
    let key = (scheme.to_string(), container.to_string());
    let mut sessions = OBJECT_SESSIONS.lock();
    if let Some(store) = sessions.get(&key) {
        return Ok(store.clone());
    }

    let store: Arc<dyn ObjectStore> = match scheme {
        "s3" => Arc::new(
            AmazonS3Builder::from_env()
                .with_bucket_name(container)
                .build()
                .map_err(|e| {
                    SinkholeError::backend_msg(format!("unable to create S3 client: {e}"))
                })?,
        ),
        "az" => {
            let account = std::env::var("AZURE_STORAGE_ACCOUNT").map_err(|_| {
                SinkholeError::Config(
                    "AZURE_STORAGE_ACCOUNT environment variable is not set".to_string(),
                )
            })?;
            let access_key = std::env::var("AZURE_STORAGE_ACCESS_KEY").map_err(|_| {
                SinkholeError::Config(
                    "AZURE_STORAGE_ACCESS_KEY environment variable is not set".to_string(),
                )
            })?;
            Arc::new(
                MicrosoftAzureBuilder::new()
                    .with_account(account)
                    .with_container_name(container)
                    .with_access_key(access_key)
                    .build()
                    .map_err(|e| {
                        SinkholeError::backend_msg(format!(
                            "unable to create Azure blob client: {e}"
                        ))
                    })?,
            )
        }
        other => {
            return Err(SinkholeError::Config(format!(
                "unsupported object store scheme '{other}'"
            )))
        }
    };

    sessions.insert(key, store.clone());
    Ok(store)
}

/// Split `scheme://container/sub/dir` into its parts. The subdirectory may
/// be empty; the container may not.
pub(crate) fn parse_object_url(url: &str) -> Result<(String, String, String)> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        SinkholeError::Config(format!("unable to parse object store url: {url}"))
    })?;
    let (container, subdir) = match rest.split_once('/') {
        Some((c, d)) => (c, d.trim_end_matches('/')),
        None => (rest, ""),
    };
    if container.is_empty() {
        return Err(SinkholeError::Config(format!(
            "object store url has no bucket/container: {url}"
        )));
    }
    Ok((
        scheme.to_ascii_lowercase(),
        container.to_string(),
        subdir.to_string(),
    ))
}

/// Archive backend that uploads finished staging files to an object store.
pub struct ObjectArchive {
    basic: BasicArchive,
    store: Arc<dyn ObjectStore>,
    container: String,
    subdir: String,
    prefix: String,
    extension: String,
}

impl ObjectArchive {
    /// Open an object-store archive for writing and stage the first file.
    pub async fn create(
        out_url: &str,
        prefix: &str,
        extension: &str,
        options: ArchiveOptions,
    ) -> Result<Self> {
        let (scheme, container, subdir) = parse_object_url(out_url)?;
        let store = object_session(&scheme, &container)?;

        let mut archive = Self {
            basic: BasicArchive::for_write(options.compress, options.buffer_size),
            store,
            container,
            subdir,
            prefix: prefix.to_string(),
            extension: extension.to_string(),
        };
        archive.stage_next()?;
        Ok(archive)
    }

    /// Open a single remote archive object for reading. The object is
    /// downloaded into a unique temp file which is removed on close.
    pub async fn open(url: &str, buffer_size: usize) -> Result<Self> {
        let (scheme, container, key) = parse_object_url(url)?;
        if key.is_empty() {
            return Err(SinkholeError::Config(format!(
                "object store url has no object key: {url}"
            )));
        }
        let store = object_session(&scheme, &container)?;

        // The temp file keeps the .lz4 suffix so the read side picks the
        // decompressor.
        let suffix = if key.to_lowercase().ends_with(".lz4") {
            ".lz4"
        } else {
            ""
        };
        let staged = tempfile::Builder::new()
            .prefix("sinkhole_download_")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| {
                SinkholeError::backend_msg(format!("unable to create download temp file: {e}"))
            })?;
        let (mut file, tmp_path) = staged.keep().map_err(|e| {
            SinkholeError::backend_msg(format!("unable to persist download temp file: {e}"))
        })?;

        let object_path = ObjectPath::from(key.as_str());
        let response = store.get(&object_path).await.map_err(|e| {
            SinkholeError::backend_msg(format!("unable to fetch {url}: {e}"))
        })?;
        let mut stream = response.into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                SinkholeError::backend_msg(format!("download of {url} failed: {e}"))
            })?;
            file.write_all(&chunk)?;
        }
        file.sync_all()?;
        drop(file);

        Ok(Self {
            basic: BasicArchive::open_for_read(&tmp_path, buffer_size, true)?,
            store,
            container,
            subdir: key,
            prefix: String::new(),
            extension: String::new(),
        })
    }

    fn stage_next(&mut self) -> Result<()> {
        let staging_dir = std::env::temp_dir();
        self.basic
            .open_staging(&staging_dir, &self.prefix, &self.extension)
    }

    /// Upload the finished staging file as a single object, then delete it.
    /// Empty files were already deleted by `close_for_write` and skip the
    /// upload entirely.
    async fn finalize_staging(&mut self) -> Result<()> {
        let Some(staging) = self.basic.close_for_write()? else {
            return Ok(());
        };

        let file_size = std::fs::metadata(&staging)
            .map_err(|e| {
                SinkholeError::backend_msg(format!(
                    "unable to stat file {}: {e}",
                    staging.display()
                ))
            })?
            .len();

        let base = final_base_name(&staging)?;
        let final_key = if self.subdir.is_empty() {
            base.clone()
        } else {
            format!("{}/{}", self.subdir, base)
        };

        info!(
            local = %staging.display(),
            container = %self.container,
            key = %final_key,
            "uploading archive [begin]"
        );

        let (progress_tx, progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = spawn_upload_progress_reporter(base.clone(), file_size, progress_rx);
        let upload = self.upload_staging(&staging, &final_key, progress_tx).await;
        let _ = reporter.await;
        upload?;

        std::fs::remove_file(&staging).map_err(|e| {
            SinkholeError::backend_msg(format!(
                "unable to remove staging file {} after upload: {e}",
                staging.display()
            ))
        })?;

        info!(container = %self.container, key = %final_key, "uploading archive [end]");
        self.basic.record_finalized(base);
        Ok(())
    }

    async fn upload_staging(
        &self,
        staging: &Path,
        final_key: &str,
        progress: tokio::sync::mpsc::UnboundedSender<u64>,
    ) -> Result<()> {
        let mut file = std::fs::File::open(staging).map_err(|e| {
            SinkholeError::backend_msg(format!(
                "unable to reopen archive file {}: {e}",
                staging.display()
            ))
        })?;

        let object_path = ObjectPath::from(final_key);
        let multipart = self.store.put_multipart(&object_path).await.map_err(|e| {
            SinkholeError::backend_msg(format!("unable to start upload of {final_key}: {e}"))
        })?;
        let mut writer = WriteMultipart::new_with_chunk_size(multipart, UPLOAD_BLOCK_SIZE);

        let mut transferred = 0u64;
        let mut block = vec![0u8; UPLOAD_BLOCK_SIZE];
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                break;
            }
            writer
                .wait_for_capacity(UPLOAD_PARALLELISM)
                .await
                .map_err(|e| {
                    SinkholeError::backend_msg(format!("upload of {final_key} failed: {e}"))
                })?;
            writer.write(&block[..n]);
            transferred += n as u64;
            let _ = progress.send(transferred);
        }

        writer.finish().await.map_err(|e| {
            SinkholeError::backend_msg(format!(
                "upload of {} to {final_key} failed: {e}",
                staging.display()
            ))
        })?;
        Ok(())
    }
}

fn final_base_name(staging: &Path) -> Result<String> {
    let name = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(STAGING_SUFFIX)
        .map(str::to_owned)
        .ok_or_else(|| {
            SinkholeError::backend_msg(format!(
                "staging file {name} has no {STAGING_SUFFIX} suffix"
            ))
        })
}

#[async_trait]
impl Archive for ObjectArchive {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.basic.write(buf)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.basic.read(buf)
    }

    async fn flush(&mut self) -> Result<()> {
        self.basic.flush()
    }

    async fn rotate(&mut self) -> Result<()> {
        if !self.basic.is_writing() {
            return Err(SinkholeError::archive_msg(
                "rotate is not allowed on archives opened for read",
            ));
        }
        if self.basic.has_open_staging() {
            self.finalize_staging().await?;
        }
        self.stage_next()
    }

    async fn close(&mut self) -> Result<()> {
        if self.basic.is_writing() {
            self.finalize_staging().await?;
            self.basic.invalidate();
            Ok(())
        } else {
            self.basic.close_for_read()
        }
    }

    fn name(&self) -> String {
        self.basic.staging_path().to_string_lossy().into_owned()
    }

    fn is_compressed(&self) -> bool {
        self.basic.is_compressed()
    }

    fn finalized(&self) -> &[ArchiveFileDetails] {
        self.basic.finalized()
    }
}

/// List object names under a root URL, relative to its prefix.
pub async fn list(root: &str) -> Result<Vec<String>> {
    let (scheme, container, subdir) = parse_object_url(root)?;
    let store = object_session(&scheme, &container)?;

    let prefix = (!subdir.is_empty()).then(|| ObjectPath::from(subdir.as_str()));
    let mut stream = store.list(prefix.as_ref());

    let mut names = Vec::new();
    while let Some(meta) = stream.next().await {
        let meta =
            meta.map_err(|e| SinkholeError::backend_msg(format!("unable to list {root}: {e}")))?;
        let location = meta.location.to_string();
        let relative = if subdir.is_empty() {
            location
        } else {
            location
                .strip_prefix(&format!("{subdir}/"))
                .map(str::to_owned)
                .unwrap_or(location)
        };
        names.push(relative);
    }
    names.sort();
    Ok(names)
}

/// Delete the named objects under a root URL.
pub async fn delete(root: &str, names: &[String]) -> Result<()> {
    let (scheme, container, subdir) = parse_object_url(root)?;
    let store = object_session(&scheme, &container)?;

    for name in names {
        let key = if subdir.is_empty() {
            name.clone()
        } else {
            format!("{subdir}/{name}")
        };
        store
            .delete(&ObjectPath::from(key.as_str()))
            .await
            .map_err(|e| {
                SinkholeError::backend_msg(format!("unable to delete {name} under {root}: {e}"))
            })?;
    }
    Ok(())
}
