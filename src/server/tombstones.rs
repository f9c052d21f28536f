//! Tombstone registry for deleted files.
//!
//! Deletions have to stay visible long enough for lagging clients to learn
//! of them, so each one is recorded here and merged into listings until its
//! purge deadline passes. A store for the same name clears the record, which
//! is what keeps a filename from appearing both live and deleted.

use crate::wire::{unix_secs, FileEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a deletion stays visible.
pub const PURGE_TTL: Duration = Duration::from_secs(60 * 60);

/// Cadence of the purge sweep.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Record of one deletion.
#[derive(Debug, Clone)]
pub struct TombstoneRecord {
    pub deleted_at: SystemTime,
    pub purge_at: SystemTime,
}

/// Table of deletions, purged on a fixed cadence.
pub struct TombstoneRegistry {
    records: RwLock<HashMap<String, TombstoneRecord>>,
    purge_ttl: Duration,
    stop: CancellationToken,
}

impl TombstoneRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_config(PURGE_TTL, PURGE_INTERVAL)
    }

    /// Custom purge TTL and sweep cadence, for tests and tuning.
    pub fn with_config(purge_ttl: Duration, purge_interval: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            purge_ttl,
            stop: CancellationToken::new(),
        });
        let sweeper = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(purge_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = sweeper.stop.cancelled() => return,
                    _ = ticker.tick() => sweeper.purge_expired().await,
                }
            }
        });
        registry
    }

    /// Record a deletion. The first insert stamps the times; later inserts
    /// for the same name are no-ops.
    pub async fn insert(&self, filename: &str) {
        let mut records = self.records.write().await;
        if records.contains_key(filename) {
            return;
        }
        let now = SystemTime::now();
        records.insert(
            filename.to_string(),
            TombstoneRecord {
                deleted_at: now,
                purge_at: now + self.purge_ttl,
            },
        );
    }

    /// Drop the record for a name; silent when absent.
    pub async fn remove(&self, filename: &str) {
        self.records.write().await.remove(filename);
    }

    pub async fn get(&self, filename: &str) -> Option<TombstoneRecord> {
        self.records.read().await.get(filename).cloned()
    }

    /// Whether the name is currently marked deleted.
    pub async fn is_deleted(&self, filename: &str) -> bool {
        self.records.read().await.contains_key(filename)
    }

    /// Append one entry per tombstone to a live-file listing, each flagged
    /// deleted with mtime equal to the deletion time.
    pub async fn merge_into(&self, listing: &mut Vec<FileEntry>) {
        let records = self.records.read().await;
        for (filename, record) in records.iter() {
            listing.push(FileEntry {
                filename: filename.clone(),
                size: 0,
                mtime: unix_secs(record.deleted_at),
                crc_checksum: 0,
                deleted: true,
            });
        }
    }

    /// Stop the purge sweep. Idempotent.
    pub fn close(&self) {
        self.stop.cancel();
    }

    async fn purge_expired(&self) {
        let now = SystemTime::now();
        let mut records = self.records.write().await;
        records.retain(|filename, record| {
            let keep = now <= record.purge_at;
            if !keep {
                debug!("purging tombstone for {}", filename);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let tombstones = TombstoneRegistry::new();
        tombstones.insert("d.txt").await;
        let first = tombstones.get("d.txt").await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        tombstones.insert("d.txt").await;
        let second = tombstones.get("d.txt").await.unwrap();

        assert_eq!(
            first.deleted_at, second.deleted_at,
            "re-insert must not restamp the deletion time"
        );
        tombstones.close();
    }

    #[tokio::test]
    async fn test_remove_and_is_deleted() {
        let tombstones = TombstoneRegistry::new();
        assert!(!tombstones.is_deleted("f").await);

        tombstones.insert("f").await;
        assert!(tombstones.is_deleted("f").await);

        tombstones.remove("f").await;
        assert!(!tombstones.is_deleted("f").await);
        tombstones.remove("f").await; // silent when absent
        tombstones.close();
    }

    #[tokio::test]
    async fn test_merge_appends_deleted_entries() {
        let tombstones = TombstoneRegistry::new();
        tombstones.insert("gone.txt").await;
        let stamp = tombstones.get("gone.txt").await.unwrap();

        let mut listing = vec![FileEntry {
            filename: "live.txt".to_string(),
            size: 4,
            mtime: 100,
            crc_checksum: 2,
            deleted: false,
        }];
        tombstones.merge_into(&mut listing).await;

        assert_eq!(listing.len(), 2);
        let dead = listing.iter().find(|e| e.filename == "gone.txt").unwrap();
        assert!(dead.deleted);
        assert_eq!(dead.mtime, unix_secs(stamp.deleted_at));
        tombstones.close();
    }

    #[tokio::test]
    async fn test_sweep_purges_after_deadline() {
        let tombstones =
            TombstoneRegistry::with_config(Duration::from_millis(20), Duration::from_millis(25));
        tombstones.insert("old.txt").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(
            !tombstones.is_deleted("old.txt").await,
            "tombstone should be purged after its deadline"
        );
        tombstones.close();
    }
}
