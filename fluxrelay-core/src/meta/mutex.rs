//! Distributed mutex over the metadata store
//!
//! The holder creates the lock key attached to a short lease and keeps the
//! lease alive in the background. Waiters watch the key and retry when it
//! is deleted, which also happens when a crashed holder's lease lapses.

use super::{LeaseId, SharedMetaStore, WatchEventKind};
use crate::config::LOCK_TTL;
use crate::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound between acquisition attempts while waiting
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A named mutex shared by every process attached to the store
#[derive(Clone)]
pub struct MetaMutex {
    store: SharedMetaStore,
    key: String,
    owner: String,
}

impl MetaMutex {
    pub fn new(store: SharedMetaStore, key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try once; `None` when another holder owns the lock
    pub async fn try_lock(&self) -> Result<Option<MutexGuard>> {
        let lease = self.store.grant_lease(LOCK_TTL).await?;
        if self.store.create(&self.key, &self.owner, Some(lease)).await? {
            Ok(Some(self.guard(lease)))
        } else {
            self.store.revoke_lease(lease).await?;
            Ok(None)
        }
    }

    /// Block until the lock is held
    pub async fn lock(&self) -> Result<MutexGuard> {
        let lease = self.store.grant_lease(LOCK_TTL).await?;
        let mut watch = self.store.watch(&self.key).await?;
        loop {
            if self.store.create(&self.key, &self.owner, Some(lease)).await? {
                debug!(key = %self.key, owner = %self.owner, "mutex acquired");
                return Ok(self.guard(lease));
            }
            // keep our own lease alive while queueing
            self.store.keep_alive(lease).await?;
            let deadline = tokio::time::sleep(RETRY_INTERVAL);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = watch.recv() => match event {
                        Some(e) if e.kind == WatchEventKind::Delete && e.key == self.key => break,
                        Some(_) => continue,
                        None => {
                            watch = self.store.watch(&self.key).await?;
                            break;
                        }
                    },
                    _ = &mut deadline => break,
                }
            }
        }
    }

    fn guard(&self, lease: LeaseId) -> MutexGuard {
        let cancel = CancellationToken::new();
        let store = self.store.clone();
        let key = self.key.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOCK_TTL / 3);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(e) = store.keep_alive(lease).await {
                            warn!(key = %key, error = %e, "mutex lease keepalive failed");
                        }
                    }
                }
            }
        });
        MutexGuard {
            store: self.store.clone(),
            key: self.key.clone(),
            lease,
            cancel,
            released: false,
        }
    }
}

/// Held lock; released on `unlock` or (best effort) on drop
pub struct MutexGuard {
    store: SharedMetaStore,
    key: String,
    lease: LeaseId,
    cancel: CancellationToken,
    released: bool,
}

impl MutexGuard {
    pub async fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.cancel.cancel();
        debug!(key = %self.key, "mutex released");
        self.store.revoke_lease(self.lease).await
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();
        let store = self.store.clone();
        let lease = self.lease;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.revoke_lease(lease).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MemoryMetaStore, MetaStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exclusive_and_handoff() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let a = MetaMutex::new(store.clone(), "/lock", "a");
        let b = MetaMutex::new(store.clone(), "/lock", "b");

        let guard = a.lock().await.unwrap();
        assert!(b.try_lock().await.unwrap().is_none());
        assert_eq!(store.get("/lock").await.unwrap().as_deref(), Some("a"));

        let waiter = tokio::spawn(async move { b.lock().await.map(|_g| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        guard.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
