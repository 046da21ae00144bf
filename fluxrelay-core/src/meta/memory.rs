//! In-process metadata store
//!
//! Linearizable because every operation runs under one lock. Leases expire
//! lazily: each call first reaps leases past their deadline, emitting delete
//! events for their keys. A bounded event log backs revision-based long
//! polling for the HTTP metadata service.

use super::{KeyValue, LeaseId, MetaStore, WatchEvent, WatchEventKind, WatchStream};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Events retained for long-poll watchers
const EVENT_LOG_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<String, (String, Option<LeaseId>)>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    revision: u64,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    log: VecDeque<WatchEvent>,
}

impl State {
    fn emit(&mut self, kind: WatchEventKind, key: &str, value: String) {
        self.revision += 1;
        let event = WatchEvent {
            kind,
            key: key.to_string(),
            value,
            revision: self.revision,
        };
        self.watchers
            .retain(|(prefix, tx)| !key.starts_with(prefix.as_str()) || tx.send(event.clone()).is_ok());
        if self.log.len() == EVENT_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(event);
    }

    fn put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        if let Some((_, Some(old))) = self.data.get(key) {
            let old = *old;
            if let Some(l) = self.leases.get_mut(&old) {
                l.keys.remove(key);
            }
        }
        if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }
        self.data.insert(key.to_string(), (value.to_string(), lease));
        self.emit(WatchEventKind::Put, key, value.to_string());
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.data.remove(key) {
            Some((value, lease)) => {
                if let Some(l) = lease.and_then(|id| self.leases.get_mut(&id)) {
                    l.keys.remove(key);
                }
                self.emit(WatchEventKind::Delete, key, value);
                true
            }
            None => false,
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        if let Some(lease) = self.leases.remove(&id) {
            let mut keys: Vec<_> = lease.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                if let Some((value, _)) = self.data.remove(&key) {
                    self.emit(WatchEventKind::Delete, &key, value);
                }
            }
        }
    }

    fn reap(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(lease = id, "lease expired");
            self.drop_lease(id);
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => {
                Err(crate::RelayError::Meta(format!("lease {} not found", id)))
            }
            _ => Ok(()),
        }
    }
}

/// Metadata store living in this process
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    state: Mutex<State>,
    changed: Notify,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock();
        state.reap(Instant::now());
        let before = state.revision;
        let out = f(&mut state);
        let changed = state.revision != before;
        drop(state);
        if changed {
            self.changed.notify_waiters();
        }
        out
    }

    /// Logged events after `revision` under `prefix`
    ///
    /// Returns `None` when the log no longer reaches back to `revision`;
    /// the caller must then resynchronise from a snapshot.
    pub fn events_after(&self, prefix: &str, revision: u64) -> Option<Vec<WatchEvent>> {
        self.with_state(|state| {
            if let Some(first) = state.log.front() {
                if first.revision > revision + 1 {
                    return None;
                }
            }
            Some(
                state
                    .log
                    .iter()
                    .filter(|e| e.revision > revision && e.key.starts_with(prefix))
                    .cloned()
                    .collect(),
            )
        })
    }

    /// Wait until events after `revision` exist under `prefix`, or `timeout`
    pub async fn wait_events(
        &self,
        prefix: &str,
        revision: u64,
        timeout: Duration,
    ) -> Option<Vec<WatchEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.events_after(prefix, revision) {
                Some(events) if events.is_empty() => {}
                other => return other,
            }
            // leases can lapse without any write; wake up to reap them
            let wake = (Instant::now() + Duration::from_millis(250)).min(deadline);
            if tokio::time::timeout_at(wake, notified).await.is_err() && Instant::now() >= deadline {
                return Some(Vec::new());
            }
        }
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_state(|s| s.data.get(key).map(|(v, _)| v.clone())))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        Ok(self.with_state(|s| {
            s.data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, (v, lease))| KeyValue {
                    key: k.clone(),
                    value: v.clone(),
                    lease: *lease,
                })
                .collect()
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.with_state(|s| {
            s.check_lease(lease)?;
            s.put(key, value, lease);
            Ok(())
        })
    }

    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool> {
        self.with_state(|s| {
            s.check_lease(lease)?;
            if s.data.contains_key(key) {
                return Ok(false);
            }
            s.put(key, value, lease);
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_state(|s| s.delete(key)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.with_state(|s| {
            let keys: Vec<String> = s
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter(|k| s.delete(k)).count()
        }))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| s.watchers.push((prefix.to_string(), tx)));
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        Ok(self.with_state(|s| {
            s.next_lease += 1;
            let id = s.next_lease;
            s.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: HashSet::new(),
                },
            );
            id
        }))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.with_state(|s| match s.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(crate::RelayError::Meta(format!("lease {} not found", lease))),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.with_state(|s| s.drop_lease(lease));
        Ok(())
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.with_state(|s| s.revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let store = MemoryMetaStore::new();
        store.put("/a/1", "x", None).await.unwrap();
        store.put("/a/2", "y", None).await.unwrap();
        store.put("/b/1", "z", None).await.unwrap();

        assert_eq!(store.get("/a/1").await.unwrap().as_deref(), Some("x"));
        let kvs = store.get_prefix("/a/").await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[1].value, "y");

        assert_eq!(store.delete_prefix("/a/").await.unwrap(), 2);
        assert!(store.get("/a/1").await.unwrap().is_none());
        assert_eq!(store.revision().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_create_is_put_if_absent() {
        let store = MemoryMetaStore::new();
        assert!(store.create("/k", "a", None).await.unwrap());
        assert!(!store.create("/k", "b", None).await.unwrap());
        assert_eq!(store.get("/k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_watch_emits_in_order() {
        let store = MemoryMetaStore::new();
        let mut watch = store.watch("/w/").await.unwrap();
        store.put("/w/a", "1", None).await.unwrap();
        store.put("/other", "1", None).await.unwrap();
        store.delete("/w/a").await.unwrap();

        let put = watch.recv().await.unwrap();
        assert_eq!(put.kind, WatchEventKind::Put);
        assert_eq!(put.key, "/w/a");
        let del = watch.recv().await.unwrap();
        assert_eq!(del.kind, WatchEventKind::Delete);
        assert_eq!(del.value, "1");
        assert!(watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_keys() {
        let store = MemoryMetaStore::new();
        let lease = store.grant_lease(Duration::from_secs(60)).await.unwrap();
        store.put("/l/a", "1", Some(lease)).await.unwrap();
        store.put("/l/b", "1", None).await.unwrap();
        let mut watch = store.watch("/l/").await.unwrap();

        store.revoke_lease(lease).await.unwrap();
        assert!(store.get("/l/a").await.unwrap().is_none());
        assert!(store.get("/l/b").await.unwrap().is_some());
        assert_eq!(watch.recv().await.unwrap().kind, WatchEventKind::Delete);
        assert!(store.put("/l/c", "1", Some(lease)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry() {
        let store = MemoryMetaStore::new();
        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put("/e", "1", Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        store.keep_alive(lease).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("/e").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("/e").await.unwrap().is_none());
        assert!(store.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_events_after() {
        let store = MemoryMetaStore::new();
        store.put("/p/a", "1", None).await.unwrap();
        let rev = store.revision().await.unwrap();
        store.put("/p/b", "2", None).await.unwrap();
        store.put("/q/c", "3", None).await.unwrap();

        let events = store.events_after("/p/", rev).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "/p/b");

        let waited = store
            .wait_events("/p/", rev + 2, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(waited.is_empty());
    }
}
