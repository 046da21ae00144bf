//! Node collection
//!
//! In-memory cache of cluster members, initialised from a snapshot and kept
//! current by the metadata watch. Members are owned here; the ring refers to
//! them by name only.

use crate::meta::NodeStore;
use crate::{Member, NodeStatus, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked after a member was removed from the store
pub type RemoveHandler = Box<dyn Fn(&Member) + Send + Sync>;

/// Cached view of every member
pub struct NodeCollection {
    store: NodeStore,
    members: RwLock<BTreeMap<String, Member>>,
    on_remove: Mutex<Option<Arc<RemoveHandler>>>,
}

impl NodeCollection {
    pub fn new(store: NodeStore) -> Self {
        Self {
            store,
            members: RwLock::new(BTreeMap::new()),
            on_remove: Mutex::new(None),
        }
    }

    /// Replace the cache with a fresh snapshot
    ///
    /// Members missing from the snapshot count as removed.
    pub async fn load(&self) -> Result<()> {
        let fresh: BTreeMap<String, Member> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        let previous = std::mem::replace(&mut *self.members.write(), fresh);
        let gone: Vec<Member> = {
            let current = self.members.read();
            previous
                .into_values()
                .filter(|m| !current.contains_key(&m.name))
                .collect()
        };
        for member in gone {
            self.notify_removed(&member);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    /// Every member, ordered by name
    pub fn get_all(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Members with the given status
    pub fn with_status(&self, status: NodeStatus) -> Vec<Member> {
        self.members
            .read()
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect()
    }

    /// Write a member to the store and the cache
    pub async fn persist(&self, member: &Member) -> Result<()> {
        self.store.persist(member).await?;
        self.members.write().insert(member.name.clone(), member.clone());
        Ok(())
    }

    /// Delete a member from the store
    ///
    /// The handler runs once per deletion: here, or in the watch when the
    /// delete event drops the cache entry first.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        if !self.store.remove(name).await? {
            return Ok(false);
        }
        self.evict(name);
        Ok(true)
    }

    /// Drop `name` from the cache, running the handler if it was there
    fn evict(&self, name: &str) {
        let removed = self.members.write().remove(name);
        if let Some(member) = removed {
            self.notify_removed(&member);
        }
    }

    fn notify_removed(&self, member: &Member) {
        let handler = self.on_remove.lock().clone();
        if let Some(handler) = handler {
            handler(member);
        }
    }

    /// Register the single remove handler
    ///
    /// # Panics
    ///
    /// Panics when a handler is already registered.
    pub fn on_remove(&self, handler: impl Fn(&Member) + Send + Sync + 'static) {
        let mut slot = self.on_remove.lock();
        if slot.is_some() {
            panic!("NodeCollection::on_remove handler registered twice");
        }
        *slot = Some(Arc::new(Box::new(handler)));
    }

    /// Apply cache updates from the store until `cancel` fires
    pub async fn sync(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.store.watch().await?;
        self.load().await?;
        info!(members = self.members.read().len(), "node collection synced");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = watch.recv() => {
                    let Some(event) = event else {
                        warn!("node watch closed; resyncing");
                        watch = self.store.watch().await?;
                        self.load().await?;
                        continue;
                    };
                    match self.store.decode(&event) {
                        Ok((name, Some(member))) => {
                            debug!(member = %name, status = %member.status, "member updated");
                            self.members.write().insert(name, member);
                        }
                        Ok((name, None)) => {
                            debug!(member = %name, "member deleted");
                            self.evict(&name);
                        }
                        Err(e) => warn!(error = %e, "skipping undecodable member event"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Keyspace, MemoryMetaStore, SharedMetaStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn collection() -> NodeCollection {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        NodeCollection::new(NodeStore::new(store, Keyspace::new("/fluxrelay", "t")))
    }

    #[tokio::test]
    async fn test_persist_and_remove_handler() {
        let nodes = collection();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        nodes.on_remove(move |m| {
            assert_eq!(m.name, "a");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        nodes.persist(&Member::new("a", "h:1")).await.unwrap();
        assert_eq!(nodes.get("a").unwrap().location, "h:1");
        assert!(nodes.remove("a").await.unwrap());
        assert!(!nodes.remove("a").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(nodes.get_all().is_empty());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_second_handler_panics() {
        let nodes = collection();
        nodes.on_remove(|_| {});
        nodes.on_remove(|_| {});
    }

    #[tokio::test]
    async fn test_sync_follows_peer_writes() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let local = Arc::new(NodeCollection::new(NodeStore::new(store.clone(), keys.clone())));
        let peer = NodeStore::new(store, keys);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(local.clone().sync(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        peer.persist(&Member::new("b", "h:2").with_status(NodeStatus::Up))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(local.get("b").unwrap().status, NodeStatus::Up);
        assert_eq!(local.with_status(NodeStatus::Up).len(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_peer_delete_runs_handler_once() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let local = Arc::new(NodeCollection::new(NodeStore::new(store.clone(), keys.clone())));
        let peer = NodeStore::new(store, keys);
        let removed = Arc::new(Mutex::new(Vec::new()));
        let seen = removed.clone();
        local.on_remove(move |m| seen.lock().push(m.name.clone()));

        peer.persist(&Member::new("b", "h:2")).await.unwrap();
        peer.persist(&Member::new("c", "h:3")).await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(local.clone().sync(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(local.get_all().len(), 2);

        assert!(peer.remove("b").await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(local.get("b").is_none());
        // a local remove racing the watch still reports c once
        assert!(local.remove("c").await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*removed.lock(), vec!["b".to_string(), "c".to_string()]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resync_reports_vanished_members() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let local = NodeCollection::new(NodeStore::new(store.clone(), keys.clone()));
        let peer = NodeStore::new(store, keys);
        local.persist(&Member::new("a", "h:1")).await.unwrap();
        local.persist(&Member::new("b", "h:2")).await.unwrap();
        let removed = Arc::new(AtomicUsize::new(0));
        let seen = removed.clone();
        local.on_remove(move |m| {
            assert_eq!(m.name, "b");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        peer.remove("b").await.unwrap();
        local.load().await.unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(local.get_all().len(), 1);
    }
}
