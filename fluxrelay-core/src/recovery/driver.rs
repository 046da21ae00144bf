//! Recovery driver
//!
//! Two roles run on every member. As a *target* coming back from an outage
//! the member flips itself to `recovering` until every holder has replayed
//! its hints. As a *holder* it watches its own hints and replays recovery
//! logs to targets that are reachable again.

use super::store::RecoveryStore;
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::RECOVERY_POLL_INTERVAL;
use crate::meta::{HintStatus, HintStore};
use crate::nodes::NodeCollection;
use crate::tsdb::SharedConnector;
use crate::{NodeStatus, RelayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Retry {
    backoff: Backoff,
    not_before: Instant,
}

/// Drives hinted recovery for one member
pub struct RecoveryDriver {
    name: String,
    nodes: Arc<NodeCollection>,
    hints: HintStore,
    store: Arc<RecoveryStore>,
    connector: SharedConnector,
    backoff: BackoffConfig,
}

impl RecoveryDriver {
    pub fn new(
        nodes: Arc<NodeCollection>,
        hints: HintStore,
        store: Arc<RecoveryStore>,
        connector: SharedConnector,
    ) -> Self {
        Self {
            name: store.holder().to_string(),
            nodes,
            hints,
            store,
            connector,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Target side: wait for holders to drain hints addressed to this member
    ///
    /// Returns `false` without touching the member when nothing is hinted.
    /// Otherwise the member is `recovering` until the last hint clears and
    /// `up` afterwards.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<bool> {
        let holders = self.hints.get_by_target(&self.name).await?;
        if holders.is_empty() {
            return Ok(false);
        }
        self.set_status(NodeStatus::Recovering).await?;
        info!(
            node = %self.name,
            holders = holders.len(),
            "waiting for holders to replay buffered writes"
        );

        loop {
            let remaining = self.hints.get_by_target(&self.name).await?;
            if remaining.is_empty() {
                break;
            }
            debug!(node = %self.name, remaining = remaining.len(), "hints outstanding");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(RECOVERY_POLL_INTERVAL) => {}
            }
        }

        self.set_status(NodeStatus::Up).await?;
        info!(node = %self.name, "recovery complete");
        Ok(true)
    }

    async fn set_status(&self, status: NodeStatus) -> Result<()> {
        let mut member = self
            .nodes
            .get(&self.name)
            .ok_or_else(|| RelayError::NotFound(format!("node {} is not registered", self.name)))?;
        member.status = status;
        self.nodes.persist(&member).await
    }

    /// Re-create hints for logs whose hint write never happened
    pub async fn restore_hints(&self) -> Result<usize> {
        let hinted = self.hints.get_by_holder(&self.name).await?;
        let mut restored = 0;
        for target in self.store.targets()? {
            if !hinted.contains(&target) {
                self.hints.put(&target, &self.name, HintStatus::Waiting).await?;
                restored += 1;
            }
        }
        if restored > 0 {
            info!(node = %self.name, restored, "restored hints for orphaned recovery logs");
        }
        Ok(restored)
    }

    /// Holder side: one pass over every hint this member holds
    async fn replay_ready(&self, retries: &mut HashMap<String, Retry>) -> Result<()> {
        for target in self.hints.get_by_holder(&self.name).await? {
            if retries.get(&target).is_some_and(|r| r.not_before > Instant::now()) {
                continue;
            }
            let Some(member) = self.nodes.get(&target) else {
                debug!(node = %target, "hinted member unknown, waiting");
                continue;
            };
            match member.status {
                NodeStatus::Up | NodeStatus::Recovering => {}
                NodeStatus::Removed => {
                    info!(node = %target, "hinted member removed, discarding recovery log");
                    self.store.drop_log(&target).await?;
                    self.hints.done(&target, &self.name).await?;
                    retries.remove(&target);
                    continue;
                }
                NodeStatus::Joining | NodeStatus::Idle => continue,
            }

            self.hints.put(&target, &self.name, HintStatus::Recovering).await?;
            let tsdb = self.connector.connect(&member.location);
            let result = self
                .store
                .replay(&target, |record| {
                    let tsdb = tsdb.clone();
                    async move { tsdb.write(&record.into_request()).await }
                })
                .await;
            match result {
                Ok(_) => {
                    retries.remove(&target);
                }
                Err(e) => {
                    let retry = retries.entry(target.clone()).or_insert_with(|| Retry {
                        backoff: Backoff::new(self.backoff),
                        not_before: Instant::now(),
                    });
                    let delay = retry.backoff.next_delay();
                    retry.not_before = Instant::now() + delay;
                    warn!(node = %target, error = %e, retry_in = ?delay, "replay failed");
                    self.hints.put(&target, &self.name, HintStatus::Waiting).await?;
                }
            }
        }
        Ok(())
    }

    /// Holder loop, until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.hints.watch().await?;
        if let Err(e) = self.restore_hints().await {
            warn!(error = %e, "could not restore hints");
        }
        let mut retries = HashMap::new();
        loop {
            if let Err(e) = self.replay_ready(&mut retries).await {
                warn!(error = %e, "recovery pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = watch.recv() => {
                    if event.is_none() {
                        watch = self.hints.watch().await?;
                    }
                }
                _ = tokio::time::sleep(RECOVERY_POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Keyspace, MemoryMetaStore, NodeStore, SharedMetaStore};
    use crate::tsdb::{MemoryCluster, Tsdb, WriteRequest};
    use crate::Member;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        nodes: Arc<NodeCollection>,
        hints: HintStore,
        store: Arc<RecoveryStore>,
        cluster: Arc<MemoryCluster>,
    }

    async fn fixture(holder: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let meta: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let nodes = Arc::new(NodeCollection::new(NodeStore::new(meta.clone(), keys.clone())));
        let hints = HintStore::new(meta, keys);
        let store = Arc::new(RecoveryStore::open(dir.path(), holder, hints.clone()).unwrap());
        Fixture {
            _dir: dir,
            nodes,
            hints,
            store,
            cluster: Arc::new(MemoryCluster::new()),
        }
    }

    fn driver(f: &Fixture, name: &str) -> RecoveryDriver {
        let store = if name == f.store.holder() {
            f.store.clone()
        } else {
            Arc::new(RecoveryStore::open(f._dir.path().join(name), name, f.hints.clone()).unwrap())
        };
        RecoveryDriver::new(f.nodes.clone(), f.hints.clone(), store, f.cluster.clone())
    }

    #[tokio::test]
    async fn test_holder_replays_to_reachable_target() {
        let f = fixture("a").await;
        f.nodes
            .persist(&Member::new("b", "b:8086").with_status(NodeStatus::Up))
            .await
            .unwrap();
        let b = f.cluster.get("b:8086");
        b.query("", "CREATE DATABASE db", None).await.unwrap();
        b.set_online(false);

        f.store
            .put("b", &WriteRequest::new("db", "cpu value=1 1"))
            .await
            .unwrap();

        let driver = driver(&f, "a");
        let mut retries = HashMap::new();
        driver.replay_ready(&mut retries).await.unwrap();
        assert_eq!(f.hints.get_by_target("b").await.unwrap().len(), 1);
        assert!(retries.contains_key("b"));

        b.set_online(true);
        retries.clear();
        driver.replay_ready(&mut retries).await.unwrap();
        assert!(f.hints.get_by_target("b").await.unwrap().is_empty());
        assert_eq!(b.points("db").len(), 1);
    }

    #[tokio::test]
    async fn test_removed_target_log_is_discarded() {
        let f = fixture("a").await;
        f.nodes
            .persist(&Member::new("b", "b:8086").with_status(NodeStatus::Removed))
            .await
            .unwrap();
        f.store
            .put("b", &WriteRequest::new("db", "cpu value=1 1"))
            .await
            .unwrap();

        driver(&f, "a").replay_ready(&mut HashMap::new()).await.unwrap();
        assert!(f.hints.all().await.unwrap().is_empty());
        assert!(f.store.targets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_target_recovers_after_hints_clear() {
        let f = fixture("a").await;
        f.nodes
            .persist(&Member::new("b", "b:8086").with_status(NodeStatus::Up))
            .await
            .unwrap();
        f.hints.put("b", "a", HintStatus::Waiting).await.unwrap();

        let target = Arc::new(driver(&f, "b"));
        let cancel = CancellationToken::new();
        let task = {
            let target = target.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { target.recover(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.nodes.get("b").unwrap().status, NodeStatus::Recovering);

        f.hints.done("b", "a").await.unwrap();
        assert!(task.await.unwrap().unwrap());
        assert_eq!(f.nodes.get("b").unwrap().status, NodeStatus::Up);
    }

    #[tokio::test]
    async fn test_nothing_hinted_leaves_status_alone() {
        let f = fixture("b").await;
        f.nodes
            .persist(&Member::new("b", "b:8086").with_status(NodeStatus::Up))
            .await
            .unwrap();
        assert!(!driver(&f, "b").recover(&CancellationToken::new()).await.unwrap());
    }
}
