//! Flat-namespace disk storage.
//!
//! A mount directory holds one regular file per name in the namespace; no
//! subdirectories, no metadata sidecars. Size and mtime come from the
//! filesystem and the checksum is recomputed on demand. IO failures are
//! attributed to the filename they happened on and never retried here.

use crate::checksum::Fingerprint;
use crate::chunk::ChunkSender;
use crate::error::{SyncError, SyncResult};
use crate::wire::{unix_secs, FileEntry};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buffer size used when fingerprinting a file.
const CHECKSUM_READ_SIZE: usize = 1024;

/// Abstract capability set over a flat file namespace.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether the file exists. Not-found is not an error here.
    async fn exists(&self, filename: &str) -> SyncResult<bool>;

    /// Size, mtime and checksum of one file; `NotFound` when absent.
    async fn stat(&self, filename: &str) -> SyncResult<FileEntry>;

    /// Write one chunk. `overwrite` truncates first; otherwise the chunk is
    /// appended. The file is created if absent. Callers serialise writes.
    async fn save(&self, filename: &str, content: &[u8], overwrite: bool) -> SyncResult<()>;

    /// Remove the file; `NotFound` when absent so callers can tell.
    async fn delete(&self, filename: &str) -> SyncResult<()>;

    /// Read the file sequentially, delivering each non-empty buffer of at
    /// most `chunk_size` bytes to the sink. A refused chunk or a cancelled
    /// token ends the read with an error at the next chunk boundary.
    async fn read(
        &self,
        filename: &str,
        chunk_size: usize,
        sink: &ChunkSender,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// One descriptor per regular file in the mount directory.
    async fn list(&self) -> SyncResult<Vec<FileEntry>>;
}

/// Reject names that would escape the flat namespace.
pub fn validate_filename(filename: &str) -> SyncResult<()> {
    if filename.is_empty() {
        return Err(SyncError::invalid_argument("empty filename"));
    }
    if filename != filename.trim() {
        return Err(SyncError::invalid_argument(format!(
            "filename has surrounding whitespace: {:?}",
            filename
        )));
    }
    if filename.contains('/') || filename.contains('\\') || filename == "." || filename == ".." {
        return Err(SyncError::invalid_argument(format!(
            "filename must be a flat name: {:?}",
            filename
        )));
    }
    Ok(())
}

/// [`Storage`] over a local mount directory, created on demand.
pub struct DiskStorage {
    mount: PathBuf,
}

impl DiskStorage {
    pub async fn new(mount: impl Into<PathBuf>) -> SyncResult<Self> {
        let mount = mount.into();
        tokio::fs::create_dir_all(&mount)
            .await
            .map_err(|e| SyncError::storage_io(mount.display().to_string(), e))?;
        Ok(Self { mount })
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount
    }

    fn path_for(&self, filename: &str) -> PathBuf {
        self.mount.join(filename)
    }

    async fn entry_for(&self, filename: &str, meta: &std::fs::Metadata) -> SyncResult<FileEntry> {
        let mtime = meta
            .modified()
            .map_err(|e| SyncError::storage_io(filename, e))?;
        let checksum = self.checksum_file(filename).await?;
        Ok(FileEntry {
            filename: filename.to_string(),
            size: meta.len() as i64,
            mtime: unix_secs(mtime),
            crc_checksum: checksum,
            deleted: false,
        })
    }

    async fn checksum_file(&self, filename: &str) -> SyncResult<u32> {
        let mut file = File::open(self.path_for(filename))
            .await
            .map_err(|e| file_err(filename, e))?;
        let mut fp = Fingerprint::new();
        let mut buf = vec![0u8; CHECKSUM_READ_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::storage_io(filename, e))?;
            if n == 0 {
                break;
            }
            fp.update(&buf[..n]);
        }
        Ok(fp.finish())
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn exists(&self, filename: &str) -> SyncResult<bool> {
        validate_filename(filename)?;
        match tokio::fs::metadata(self.path_for(filename)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::storage_io(filename, e)),
        }
    }

    async fn stat(&self, filename: &str) -> SyncResult<FileEntry> {
        validate_filename(filename)?;
        let meta = tokio::fs::metadata(self.path_for(filename))
            .await
            .map_err(|e| file_err(filename, e))?;
        if !meta.is_file() {
            return Err(SyncError::not_found(filename));
        }
        self.entry_for(filename, &meta).await
    }

    async fn save(&self, filename: &str, content: &[u8], overwrite: bool) -> SyncResult<()> {
        validate_filename(filename)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        if overwrite {
            options.truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(self.path_for(filename))
            .await
            .map_err(|e| SyncError::storage_io(filename, e))?;
        file.write_all(content)
            .await
            .map_err(|e| SyncError::storage_io(filename, e))?;
        Ok(())
    }

    async fn delete(&self, filename: &str) -> SyncResult<()> {
        validate_filename(filename)?;
        tokio::fs::remove_file(self.path_for(filename))
            .await
            .map_err(|e| file_err(filename, e))
    }

    async fn read(
        &self,
        filename: &str,
        chunk_size: usize,
        sink: &ChunkSender,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        validate_filename(filename)?;
        let mut file = File::open(self.path_for(filename))
            .await
            .map_err(|e| file_err(filename, e))?;
        let mut buf = vec![0u8; chunk_size];
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::storage_io(filename, e))?;
            if n == 0 {
                return Ok(());
            }
            sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
    }

    async fn list(&self) -> SyncResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.mount)
            .await
            .map_err(|e| SyncError::storage_io(self.mount.display().to_string(), e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SyncError::storage_io(self.mount.display().to_string(), e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                debug!("skipping non-UTF8 entry in {}", self.mount.display());
                continue;
            };
            // Dotfiles (the watch lock among them) are not part of the
            // namespace; subdirectories never are.
            if name.starts_with('.') {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| SyncError::storage_io(&name, e))?;
            if !meta.is_file() {
                continue;
            }
            entries.push(self.entry_for(&name, &meta).await?);
        }
        Ok(entries)
    }
}

/// Attribute an IO error to a file, preserving the not-found distinction.
fn file_err(filename: &str, e: io::Error) -> SyncError {
    if e.kind() == io::ErrorKind::NotFound {
        SyncError::not_found(filename)
    } else {
        SyncError::storage_io(filename, e)
    }
}
