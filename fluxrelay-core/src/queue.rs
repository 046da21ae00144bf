//! Durable work queues
//!
//! A FIFO per `(work type, target)` kept under
//! `tasks/pending/<type>/<target>/<id>`. Task ids are time-ordered UUIDs,
//! so key order is push order. A subscriber holds the queue's metadata
//! mutex for as long as it lives, which keeps consumption single-worker
//! across the cluster.

use crate::meta::{Keyspace, MetaMutex, MutexGuard, SharedMetaStore, WatchEventKind, WatchStream};
use crate::{RelayError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kinds of queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    /// Pull token ranges into the target
    Import,
    /// Drop series of tokens the target no longer owns
    DeleteByToken,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Import => "import",
            WorkType::DeleteByToken => "delete_by_token",
        }
    }
}

/// A queued unit of work with its resume point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task<P> {
    pub id: String,
    pub target: String,
    pub payload: P,
    /// Progress committed by `check_in`
    #[serde(default)]
    pub checkpoint: usize,
}

/// Producer and consumer handle for one work type
pub struct WorkQueue<P> {
    store: SharedMetaStore,
    keys: Keyspace,
    work_type: WorkType,
    owner: String,
    subscribed: Arc<Mutex<HashSet<String>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> WorkQueue<P>
where
    P: Serialize + DeserializeOwned + Send,
{
    /// `owner` identifies this process in the queue mutexes
    pub fn new(store: SharedMetaStore, keys: Keyspace, work_type: WorkType, owner: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            work_type,
            owner: owner.into(),
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            _payload: PhantomData,
        }
    }

    pub fn work_type(&self) -> WorkType {
        self.work_type
    }

    fn key(&self, target: &str, id: &str) -> String {
        self.keys.task(self.work_type.as_str(), target, id)
    }

    fn write(&self, task: &Task<P>) -> impl std::future::Future<Output = Result<()>> + '_ {
        let key = self.key(&task.target, &task.id);
        let value = serde_json::to_string(task);
        async move { self.store.put(&key, &value?, None).await }
    }

    /// Append a task for `target`
    pub async fn push(&self, target: &str, payload: P) -> Result<Task<P>> {
        let task = Task {
            id: Uuid::now_v7().to_string(),
            target: target.to_string(),
            payload,
            checkpoint: 0,
        };
        self.write(&task).await?;
        debug!(work = self.work_type.as_str(), target = %target, id = %task.id, "task queued");
        Ok(task)
    }

    /// Tasks currently queued for `target`, oldest first
    pub async fn pending(&self, target: &str) -> Result<Vec<Task<P>>> {
        let prefix = self.keys.tasks_pending(self.work_type.as_str(), target);
        self.store
            .get_prefix(&prefix)
            .await?
            .iter()
            .map(|kv| Ok(serde_json::from_str(&kv.value)?))
            .collect()
    }

    /// Persist task progress so a restarted subscriber resumes from it
    pub async fn check_in(&self, task: &Task<P>) -> Result<()> {
        self.write(task).await
    }

    /// Remove a finished task
    pub async fn complete(&self, task: &Task<P>) -> Result<()> {
        self.store.delete(&self.key(&task.target, &task.id)).await?;
        debug!(work = self.work_type.as_str(), id = %task.id, "task complete");
        Ok(())
    }

    /// Give up on a task; it stays queued for a later subscriber
    pub async fn drop_task(&self, task: &Task<P>) -> Result<()> {
        warn!(work = self.work_type.as_str(), id = %task.id, "task dropped");
        Ok(())
    }

    /// Become the single consumer of `target`'s queue
    ///
    /// Waits for the cluster-wide queue mutex, then yields every queued
    /// task followed by tasks pushed later.
    ///
    /// # Panics
    ///
    /// Panics when this handle already has a live subscription for `target`.
    pub async fn subscribe(&self, target: &str, cancel: &CancellationToken) -> Result<Subscription<P>> {
        if !self.subscribed.lock().insert(target.to_string()) {
            panic!(
                "work queue {}/{} subscribed twice in one process",
                self.work_type.as_str(),
                target
            );
        }
        let registration = Registration {
            subscribed: self.subscribed.clone(),
            target: target.to_string(),
        };

        let mutex = MetaMutex::new(
            self.store.clone(),
            self.keys.task_lock(self.work_type.as_str(), target),
            self.owner.clone(),
        );
        let guard = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RelayError::Internal("subscription cancelled".into()))
            }
            guard = mutex.lock() => guard?,
        };

        let prefix = self.keys.tasks_pending(self.work_type.as_str(), target);
        let watch = self.store.watch(&prefix).await?;
        let mut delivered = HashSet::new();
        let mut backlog = VecDeque::new();
        for kv in self.store.get_prefix(&prefix).await? {
            let task: Task<P> = serde_json::from_str(&kv.value)?;
            delivered.insert(task.id.clone());
            backlog.push_back(task);
        }
        debug!(work = self.work_type.as_str(), target = %target, backlog = backlog.len(), "subscribed");

        Ok(Subscription {
            backlog,
            delivered,
            watch,
            _guard: guard,
            _registration: registration,
        })
    }
}

struct Registration {
    subscribed: Arc<Mutex<HashSet<String>>>,
    target: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.subscribed.lock().remove(&self.target);
    }
}

/// Live consumer of one queue; dropping it releases the queue
pub struct Subscription<P> {
    backlog: VecDeque<Task<P>>,
    delivered: HashSet<String>,
    watch: WatchStream,
    _guard: MutexGuard,
    _registration: Registration,
}

impl<P: DeserializeOwned> Subscription<P> {
    /// Next task, or `None` once `cancel` fires or the watch ends
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Task<P>> {
        if let Some(task) = self.backlog.pop_front() {
            return Some(task);
        }
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return None,
                event = self.watch.recv() => event?,
            };
            if event.kind != WatchEventKind::Put {
                continue;
            }
            match serde_json::from_str::<Task<P>>(&event.value) {
                // check-ins rewrite delivered tasks
                Ok(task) if self.delivered.contains(&task.id) => continue,
                Ok(task) => {
                    self.delivered.insert(task.id.clone());
                    return Some(task);
                }
                Err(e) => warn!(key = %event.key, error = %e, "skipping undecodable task"),
            }
        }
    }

    /// Tasks already fetched but not yet handed out
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        tokens: Vec<u32>,
    }

    fn queue(store: &SharedMetaStore) -> WorkQueue<Job> {
        WorkQueue::new(store.clone(), Keyspace::new("/fluxrelay", "t"), WorkType::Import, "p1")
    }

    #[tokio::test]
    async fn test_snapshot_then_tail() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let q = queue(&store);
        let cancel = CancellationToken::new();
        q.push("b", Job { tokens: vec![1] }).await.unwrap();
        q.push("b", Job { tokens: vec![2] }).await.unwrap();
        q.push("c", Job { tokens: vec![9] }).await.unwrap();

        let mut sub = q.subscribe("b", &cancel).await.unwrap();
        assert_eq!(sub.next(&cancel).await.unwrap().payload.tokens, vec![1]);
        assert_eq!(sub.next(&cancel).await.unwrap().payload.tokens, vec![2]);

        q.push("b", Job { tokens: vec![3] }).await.unwrap();
        let task = tokio::time::timeout(Duration::from_secs(1), sub.next(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.payload.tokens, vec![3]);
    }

    #[tokio::test]
    async fn test_check_in_survives_resubscribe() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let q = queue(&store);
        let cancel = CancellationToken::new();
        q.push("b", Job { tokens: vec![1, 2, 3] }).await.unwrap();

        {
            let mut sub = q.subscribe("b", &cancel).await.unwrap();
            let mut task = sub.next(&cancel).await.unwrap();
            task.checkpoint = 2;
            q.check_in(&task).await.unwrap();
        }

        // the old guard releases its lease in the background
        let mut sub = tokio::time::timeout(Duration::from_secs(3), q.subscribe("b", &cancel))
            .await
            .unwrap()
            .unwrap();
        let task = sub.next(&cancel).await.unwrap();
        assert_eq!(task.checkpoint, 2);
        q.complete(&task).await.unwrap();
        assert!(q.pending("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let q = queue(&store);
        let cancel = CancellationToken::new();
        let mut sub = q.subscribe("b", &cancel).await.unwrap();
        cancel.cancel();
        assert!(sub.next(&cancel).await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "subscribed twice")]
    async fn test_double_subscribe_panics() {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let q = queue(&store);
        let cancel = CancellationToken::new();
        let _first = q.subscribe("b", &cancel).await.unwrap();
        let _second = q.subscribe("b", &cancel).await;
    }
}
