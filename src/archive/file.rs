//! Local filesystem archive backend
//!
//! Stages under a `.tmp` name in a subdirectory of the output directory
//! named after the archive prefix (`<out>/requests` for recorded traffic)
//! and finalizes by stripping the suffix and renaming in place, then
//! relaxing the file mode so group and other can read the finished
//! archive.

use crate::archive::common::{ArchiveFileDetails, BasicArchive, STAGING_SUFFIX};
use crate::archive::{strip_file_scheme, Archive, ArchiveOptions};
use crate::error::{Result, SinkholeError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Archive backend writing to a local directory.
pub struct FileArchive {
    basic: BasicArchive,
    out_dir: PathBuf,
    prefix: String,
    extension: String,
}

impl FileArchive {
    /// Open a local archive for writing and stage the first file.
    pub async fn create(
        out_url: &str,
        prefix: &str,
        extension: &str,
        options: ArchiveOptions,
    ) -> Result<Self> {
        // staging lives in <out>/<prefix>; open_staging creates the dir
        let out_dir = PathBuf::from(strip_file_scheme(out_url)).join(prefix);
        let mut archive = Self {
            basic: BasicArchive::for_write(options.compress, options.buffer_size),
            out_dir,
            prefix: prefix.to_string(),
            extension: extension.to_string(),
        };
        archive.stage_next()?;
        Ok(archive)
    }

    /// Open a local archive file for reading.
    pub async fn open(location: &str, buffer_size: usize) -> Result<Self> {
        let path = PathBuf::from(strip_file_scheme(location));
        Ok(Self {
            basic: BasicArchive::open_for_read(&path, buffer_size, false)?,
            out_dir: PathBuf::new(),
            prefix: String::new(),
            extension: String::new(),
        })
    }

    fn stage_next(&mut self) -> Result<()> {
        self.basic
            .open_staging(&self.out_dir, &self.prefix, &self.extension)
    }

    /// Rename the staging file into place and relax its mode. Skipped
    /// entirely for empty files, which `close_for_write` deletes.
    fn finalize_staging(&mut self) -> Result<()> {
        let Some(staging) = self.basic.close_for_write()? else {
            return Ok(());
        };

        let metadata = std::fs::metadata(&staging).map_err(|e| {
            SinkholeError::backend_msg(format!("unable to stat file {}: {e}", staging.display()))
        })?;

        let final_path = strip_staging_suffix(&staging)?;
        std::fs::rename(&staging, &final_path).map_err(|e| {
            SinkholeError::backend_msg(format!(
                "unable to rename archive file {}: {e}",
                staging.display()
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // only touch the group and other read bits
            let mode = metadata.permissions().mode() | 0o044;
            std::fs::set_permissions(&final_path, std::fs::Permissions::from_mode(mode)).map_err(
                |e| {
                    SinkholeError::backend_msg(format!(
                        "unable to chmod archive file {}: {e}",
                        final_path.display()
                    ))
                },
            )?;
        }
        #[cfg(not(unix))]
        let _ = metadata;

        let final_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(from = %staging.display(), to = %final_path.display(), "finalized archive file");
        self.basic.record_finalized(final_name);
        Ok(())
    }
}

fn strip_staging_suffix(staging: &Path) -> Result<PathBuf> {
    let name = staging.to_string_lossy();
    let stripped = name.strip_suffix(STAGING_SUFFIX).ok_or_else(|| {
        SinkholeError::backend_msg(format!("staging file {name} has no {STAGING_SUFFIX} suffix"))
    })?;
    Ok(PathBuf::from(stripped))
}

#[async_trait]
impl Archive for FileArchive {
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
            self.finalize_staging()?;
        }
        self.stage_next()
    }

    async fn close(&mut self) -> Result<()> {
        if self.basic.is_writing() {
            self.finalize_staging()?;
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

/// List file names directly under a local directory.
pub fn list(root: &str) -> Result<Vec<String>> {
    let dir = PathBuf::from(strip_file_scheme(root));
    let entries = std::fs::read_dir(&dir).map_err(|e| {
        SinkholeError::backend_msg(format!("unable to list {}: {e}", dir.display()))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            SinkholeError::backend_msg(format!("unable to list {}: {e}", dir.display()))
        })?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Delete the named files under a local directory.
pub fn delete(root: &str, names: &[String]) -> Result<()> {
    let dir = PathBuf::from(strip_file_scheme(root));
    for name in names {
        let path = dir.join(name);
        std::fs::remove_file(&path).map_err(|e| {
            SinkholeError::backend_msg(format!("unable to delete {}: {e}", path.display()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_finalize_strips_tmp_suffix() {
        let dir = tempdir().unwrap();
        let mut archive = FileArchive::create(
            dir.path().to_str().unwrap(),
            "requests",
            ".fbf",
            ArchiveOptions::default(),
        )
        .await
        .unwrap();

        archive.write(b"frame data").await.unwrap();
        archive.close().await.unwrap();

        let finalized = archive.finalized();
        assert_eq!(finalized.len(), 1);
        assert!(finalized[0].file_name.ends_with(".fbf"));
        assert!(dir
            .path()
            .join("requests")
            .join(&finalized[0].file_name)
            .exists());
    }

    #[tokio::test]
    async fn test_empty_archive_leaves_no_artifact() {
        let dir = tempdir().unwrap();
        let mut archive = FileArchive::create(
            dir.path().to_str().unwrap(),
            "requests",
            ".fbf",
            ArchiveOptions::default(),
        )
        .await
        .unwrap();

        archive.close().await.unwrap();
        assert!(archive.finalized().is_empty());

        let staged = dir.path().join("requests");
        assert_eq!(list(staged.to_str().unwrap()).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_rotate_produces_one_artifact() {
        let dir = tempdir().unwrap();
        let mut archive = FileArchive::create(
            dir.path().to_str().unwrap(),
            "requests",
            ".fbf",
            ArchiveOptions::default(),
        )
        .await
        .unwrap();

        archive.write(b"first").await.unwrap();
        archive.rotate().await.unwrap();
        archive.rotate().await.unwrap();
        archive.close().await.unwrap();

        assert_eq!(archive.finalized().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.fbf"), b"one").unwrap();
        std::fs::write(dir.path().join("b.fbf"), b"two").unwrap();

        let root = dir.path().to_str().unwrap();
        let names = list(root).unwrap();
        assert_eq!(names, vec!["a.fbf".to_string(), "b.fbf".to_string()]);

        delete(root, &["a.fbf".to_string()]).unwrap();
        assert_eq!(list(root).unwrap(), vec!["b.fbf".to_string()]);
    }

    #[tokio::test]
    async fn test_rotate_rejected_on_read_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.fbf");
        std::fs::write(&path, b"payload").unwrap();

        let mut archive = FileArchive::open(path.to_str().unwrap(), 0).await.unwrap();
        assert!(archive.rotate().await.is_err());
    }
}
