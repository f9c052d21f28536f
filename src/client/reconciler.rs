//! Periodic reconciliation of the local mirror against the server listing.
//!
//! Each pass polls the merged listing once and walks it entry by entry,
//! deciding per file whether to upload, download, delete locally or leave it
//! alone. The conflict rule is last-writer-wins by mtime, with ties going to
//! the server. One bad file never stalls the pass.

use crate::client::Client;
use crate::error::{SyncError, SyncResult};
use crate::wire::FileEntry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default cadence between reconciliation passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// What one reconciliation step should do for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Local and remote agree; do nothing.
    None,
    /// Download the remote copy.
    Fetch,
    /// Upload the local copy.
    Store,
    /// Remove the local copy of a remotely deleted file.
    DeleteLocal,
}

/// Decide the action for one remote entry against the local stat, if any.
pub fn decide(local: Option<&FileEntry>, remote: &FileEntry) -> SyncAction {
    let Some(local) = local else {
        if remote.deleted {
            // Both sides agree the file does not exist.
            return SyncAction::None;
        }
        return SyncAction::Fetch;
    };

    if remote.deleted {
        if remote.mtime > local.mtime {
            return SyncAction::DeleteLocal;
        }
        // The local edit is newer than the observed deletion.
        return SyncAction::None;
    }

    if local.crc_checksum == remote.crc_checksum {
        return SyncAction::None;
    }

    if local.mtime > remote.mtime {
        SyncAction::Store
    } else {
        // Ties go to the server.
        SyncAction::Fetch
    }
}

/// The periodic pull loop.
pub struct Reconciler {
    client: Arc<Client>,
    coord: Arc<Mutex<()>>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(client: Arc<Client>, coord: Arc<Mutex<()>>, interval: Duration) -> Self {
        Self {
            client,
            coord,
            interval,
        }
    }

    /// Run until cancelled, one pass per cadence tick. The coordination
    /// mutex is taken per file, never across the sleep.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.sync_once(&cancel).await;
        }
    }

    /// One full pass over the remote listing.
    pub async fn sync_once(&self, cancel: &CancellationToken) {
        let remote_files = match self.client.request_files().await {
            Ok(files) => files,
            Err(e) => {
                error!("listing poll failed: {}", e);
                return;
            }
        };

        for remote in &remote_files {
            if cancel.is_cancelled() {
                return;
            }
            let _guard = self.coord.lock().await;
            if let Err(e) = self.sync_file(remote, cancel).await {
                error!("sync of {} failed: {}", remote.filename, e);
            }
        }
    }

    async fn sync_file(&self, remote: &FileEntry, cancel: &CancellationToken) -> SyncResult<()> {
        let local = match self.client.storage().stat(&remote.filename).await {
            Ok(meta) => Some(meta),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match decide(local.as_ref(), remote) {
            SyncAction::None => Ok(()),
            SyncAction::Fetch => {
                info!("downloading {}", remote.filename);
                self.client.fetch(&remote.filename, cancel).await
            }
            SyncAction::Store => {
                info!("uploading {}", remote.filename);
                self.client.store(&remote.filename, cancel).await
            }
            SyncAction::DeleteLocal => {
                info!("removing {} (deleted on server)", remote.filename);
                match self.client.storage().delete(&remote.filename).await {
                    // Already gone locally: converged.
                    Err(SyncError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mtime: i64, crc_checksum: u32, deleted: bool) -> FileEntry {
        FileEntry {
            filename: "f.txt".to_string(),
            size: 1,
            mtime,
            crc_checksum,
            deleted,
        }
    }

    #[test]
    fn test_absent_local_fetches_live_remote() {
        assert_eq!(decide(None, &entry(10, 3, false)), SyncAction::Fetch);
    }

    #[test]
    fn test_absent_local_ignores_deleted_remote() {
        assert_eq!(decide(None, &entry(10, 0, true)), SyncAction::None);
    }

    #[test]
    fn test_newer_remote_deletion_removes_local() {
        let local = entry(10, 3, false);
        assert_eq!(
            decide(Some(&local), &entry(11, 0, true)),
            SyncAction::DeleteLocal
        );
    }

    #[test]
    fn test_local_edit_outlives_older_deletion() {
        let local = entry(12, 3, false);
        assert_eq!(decide(Some(&local), &entry(11, 0, true)), SyncAction::None);
        // A tie also keeps the local file.
        assert_eq!(decide(Some(&local), &entry(12, 0, true)), SyncAction::None);
    }

    #[test]
    fn test_matching_checksum_is_a_noop() {
        let local = entry(10, 5, false);
        // Even with differing mtimes the content fingerprint wins.
        assert_eq!(decide(Some(&local), &entry(99, 5, false)), SyncAction::None);
    }

    #[test]
    fn test_last_writer_wins_by_mtime() {
        let local = entry(20, 1, false);
        assert_eq!(decide(Some(&local), &entry(10, 2, false)), SyncAction::Store);
        assert_eq!(decide(Some(&local), &entry(30, 2, false)), SyncAction::Fetch);
    }

    #[test]
    fn test_mtime_tie_downloads() {
        let local = entry(10, 1, false);
        assert_eq!(decide(Some(&local), &entry(10, 2, false)), SyncAction::Fetch);
    }
}
