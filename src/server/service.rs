//! The file service: storage, locks and tombstones behind one surface.
//!
//! Writes (`store`, `delete`) require the caller's write access to hold up
//! under [`LockManager::check`]; reads (`fetch`, `stat`, `list`) never block
//! writers. Per-filename serialisation comes entirely from the lock, so
//! operations on different names run freely in parallel.

use crate::chunk::{ChunkReceiver, ChunkSender};
use crate::error::{SyncError, SyncResult};
use crate::server::locks::LockManager;
use crate::server::tombstones::TombstoneRegistry;
use crate::storage::Storage;
use crate::wire::{unix_secs, FileEntry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Chunk size used when reading a file out of storage for a fetch.
pub const FETCH_CHUNK_SIZE: usize = 1000;

pub struct FileService {
    storage: Arc<dyn Storage>,
    locks: Arc<LockManager>,
    tombstones: Arc<TombstoneRegistry>,
}

impl FileService {
    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        Self::with_parts(storage, LockManager::new(), TombstoneRegistry::new())
    }

    /// Assemble from pre-built registries, for tests and tuning.
    pub fn with_parts(
        storage: Arc<dyn Storage>,
        locks: Arc<LockManager>,
        tombstones: Arc<TombstoneRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            locks,
            tombstones,
        })
    }

    pub async fn acquire_write_lock(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        self.locks.acquire(filename, client_id).await
    }

    pub async fn release_lock(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        self.locks.release(filename, client_id).await
    }

    /// The live listing merged with tombstones. A name never appears twice:
    /// a successful store clears its tombstone and a delete removes the live
    /// file before inserting one.
    pub async fn list(&self) -> SyncResult<Vec<FileEntry>> {
        let mut files = self.storage.list().await?;
        self.tombstones.merge_into(&mut files).await;
        Ok(files)
    }

    /// Drain a chunk stream into storage under the caller's write access.
    ///
    /// The first chunk truncates, the rest append. On failure a partial file
    /// may remain; the next store for the name truncates it again.
    pub async fn store(
        &self,
        filename: &str,
        client_id: &str,
        mut source: ChunkReceiver,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.locks.check(filename, client_id).await?;
        self.tombstones.remove(filename).await;

        let mut overwrite = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                chunk = source.recv() => {
                    let Some(chunk) = chunk else {
                        debug!("stored {} for client {}", filename, client_id);
                        return Ok(());
                    };
                    self.storage.save(filename, &chunk, overwrite).await?;
                    overwrite = false;
                }
            }
        }
    }

    /// Read a file into the sink in bounded chunks. No lock is required; the
    /// sink is closed on completion and on error alike.
    pub async fn fetch(
        &self,
        filename: &str,
        sink: ChunkSender,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.storage
            .read(filename, FETCH_CHUNK_SIZE, &sink, cancel)
            .await
        // sink dropped here: end-of-stream either way
    }

    /// Remove a file under the caller's write access and tombstone it.
    pub async fn delete(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        self.locks.check(filename, client_id).await?;
        self.storage.delete(filename).await?;
        self.tombstones.insert(filename).await;
        debug!("deleted {} for client {}", filename, client_id);
        Ok(())
    }

    /// Stat a file. A tombstoned name reports deleted with mtime equal to
    /// the deletion time; otherwise storage answers.
    pub async fn stat(&self, filename: &str) -> SyncResult<FileEntry> {
        if let Some(record) = self.tombstones.get(filename).await {
            return Ok(FileEntry {
                filename: filename.to_string(),
                size: 0,
                mtime: unix_secs(record.deleted_at),
                crc_checksum: 0,
                deleted: true,
            });
        }
        self.storage.stat(filename).await
    }

    /// Stop both background sweeps. Idempotent.
    pub fn shutdown(&self) {
        self.tombstones.close();
        self.locks.close();
    }
}
