//! Per-file exclusive write leases.
//!
//! A lease is keyed by filename and owned by one client id. Acquiring again
//! as the owner renews the lease; anyone else gets a conflict until the lease
//! expires. An expired lease is indistinguishable from no lease: every path
//! that sees one reaps it, and a background sweep clears the stragglers.

use crate::error::{SyncError, SyncResult};
use crate::wire::unix_secs;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a lease lasts without renewal.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Cadence of the expired-lease sweep.
pub const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One write lease.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub client_id: String,
    pub acquired_at: SystemTime,
    pub expires_at: SystemTime,
}

impl LockInfo {
    fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }
}

/// Table of write leases with TTL expiry and a background sweep.
pub struct LockManager {
    locks: RwLock<HashMap<String, LockInfo>>,
    ttl: Duration,
    stop: CancellationToken,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Self::with_config(DEFAULT_LOCK_TTL, LOCK_SWEEP_INTERVAL)
    }

    /// Custom TTL and sweep cadence, for tests and tuning.
    pub fn with_config(ttl: Duration, sweep_interval: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            locks: RwLock::new(HashMap::new()),
            ttl,
            stop: CancellationToken::new(),
        });
        let sweeper = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = sweeper.stop.cancelled() => return,
                    _ = ticker.tick() => sweeper.sweep_expired().await,
                }
            }
        });
        manager
    }

    /// Take or renew the lease on `filename` for `client_id`.
    ///
    /// Succeeds when there is no live lease or the caller already holds it
    /// (renewal advances the expiry); fails with [`SyncError::LockConflict`]
    /// while another client's lease is live.
    pub async fn acquire(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        let mut locks = self.locks.write().await;
        let now = SystemTime::now();

        if let Some(lock) = locks.get_mut(filename) {
            if lock.client_id == client_id {
                lock.expires_at = now + self.ttl;
                return Ok(());
            }
            if !lock.is_expired(now) {
                return Err(SyncError::LockConflict {
                    filename: filename.to_string(),
                    holder: lock.client_id.clone(),
                    expires_at: unix_secs(lock.expires_at),
                });
            }
            debug!(
                "reaping expired lock on {} held by {}",
                filename, lock.client_id
            );
        }

        // Absent or expired either way: install a fresh record over it.
        locks.insert(
            filename.to_string(),
            LockInfo {
                client_id: client_id.to_string(),
                acquired_at: now,
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    /// Drop the lease if `client_id` owns it. Succeeds silently when there is
    /// no lease; fails when someone else owns it.
    pub async fn release(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        let mut locks = self.locks.write().await;
        match locks.get(filename) {
            None => return Ok(()),
            Some(lock) if lock.client_id != client_id => return Err(SyncError::LockOwnership),
            Some(_) => {}
        }
        locks.remove(filename);
        Ok(())
    }

    /// Verify that `client_id` may write `filename` right now: no lease, an
    /// expired lease (reaped on the way through), or a lease of its own.
    pub async fn check(&self, filename: &str, client_id: &str) -> SyncResult<()> {
        {
            let locks = self.locks.read().await;
            match locks.get(filename) {
                None => return Ok(()),
                Some(lock) if lock.is_expired(SystemTime::now()) => {} // reap below
                Some(lock) if lock.client_id == client_id => return Ok(()),
                Some(lock) => {
                    return Err(SyncError::LockConflict {
                        filename: filename.to_string(),
                        holder: lock.client_id.clone(),
                        expires_at: unix_secs(lock.expires_at),
                    })
                }
            }
        }

        // Expired: upgrade to the write side and re-check before reaping.
        let mut locks = self.locks.write().await;
        let still_expired = locks
            .get(filename)
            .map(|lock| lock.is_expired(SystemTime::now()))
            .unwrap_or(false);
        if still_expired {
            locks.remove(filename);
        }
        Ok(())
    }

    /// Inspect the current lease on a file, if any.
    pub async fn get(&self, filename: &str) -> Option<LockInfo> {
        self.locks.read().await.get(filename).cloned()
    }

    /// Stop the background sweep. Idempotent.
    pub fn close(&self) {
        self.stop.cancel();
    }

    async fn sweep_expired(&self) {
        let now = SystemTime::now();
        let mut locks = self.locks.write().await;
        locks.retain(|filename, lock| {
            let live = !lock.is_expired(now);
            if !live {
                debug!("sweeping expired lock on {}", filename);
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let locks = LockManager::new();
        locks.acquire("x", "a").await.unwrap();

        let err = locks.acquire("x", "b").await.unwrap_err();
        match err {
            SyncError::LockConflict { holder, .. } => assert_eq!(holder, "a"),
            other => panic!("expected conflict, got {:?}", other),
        }

        locks.release("x", "a").await.unwrap();
        locks.acquire("x", "b").await.unwrap();
        locks.close();
    }

    #[tokio::test]
    async fn test_reentrant_renewal_advances_expiry() {
        let locks = LockManager::new();
        locks.acquire("f", "a").await.unwrap();
        let first = locks.get("f").await.unwrap().expires_at;

        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.acquire("f", "a").await.unwrap();
        let second = locks.get("f").await.unwrap().expires_at;

        assert!(second > first, "renewal must advance the expiry");
        locks.close();
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let locks = LockManager::with_config(Duration::from_millis(30), LOCK_SWEEP_INTERVAL);
        locks.acquire("e", "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // No release ever happened, but the lease is gone for all callers.
        locks.acquire("e", "b").await.unwrap();
        let lock = locks.get("e").await.unwrap();
        assert_eq!(lock.client_id, "b");
        locks.close();
    }

    #[tokio::test]
    async fn test_check_reaps_expired_records() {
        let locks = LockManager::with_config(Duration::from_millis(30), LOCK_SWEEP_INTERVAL);
        locks.acquire("r", "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        locks.check("r", "b").await.unwrap();
        assert!(locks.get("r").await.is_none(), "check should reap expired leases");
        locks.close();
    }

    #[tokio::test]
    async fn test_check_rejects_other_holder() {
        let locks = LockManager::new();
        locks.acquire("f", "a").await.unwrap();
        locks.check("f", "a").await.unwrap();
        assert!(matches!(
            locks.check("f", "b").await,
            Err(SyncError::LockConflict { .. })
        ));
        locks.close();
    }

    #[tokio::test]
    async fn test_release_by_non_owner_fails() {
        let locks = LockManager::new();
        locks.acquire("f", "a").await.unwrap();
        assert!(matches!(
            locks.release("f", "b").await,
            Err(SyncError::LockOwnership)
        ));
        // Absent lock releases silently.
        locks.release("unlocked", "b").await.unwrap();
        locks.close();
    }

    #[tokio::test]
    async fn test_background_sweep_clears_expired() {
        let locks =
            LockManager::with_config(Duration::from_millis(20), Duration::from_millis(25));
        locks.acquire("s", "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(locks.get("s").await.is_none(), "sweep should remove the lease");
        locks.close();
    }
}
