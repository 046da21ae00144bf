//! Join and removal coordination
//!
//! A joining member steals a fair share of tokens from the most loaded
//! members: it reserves them, pulls their data, takes ownership, pulls
//! the data it now replicates and finally schedules deletes on the former
//! holders. Removal hands a member's tokens to the survivors through
//! queued import tasks.

use crate::import::{DeleteTask, ImportTask, Importer};
use crate::meta::{HintStore, Keyspace, MetaMutex, SharedMetaStore, TokenStore};
use crate::nodes::NodeCollection;
use crate::queue::WorkQueue;
use crate::resolver::{Purpose, Resolver};
use crate::{Member, NodeStatus, RelayError, Result, Token};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReport {
    /// This member initialised the cluster
    pub first: bool,
    /// Tokens owned after the join
    pub tokens: BTreeSet<Token>,
    /// Delete tasks queued for former holders
    pub delete_tasks: usize,
}

/// Result of a removal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Recipient to the tokens it takes over
    pub assignments: BTreeMap<String, BTreeSet<Token>>,
    /// Hints held by the removed member that were discarded
    pub hints_cleared: usize,
}

/// Pick tokens a new member should take over
///
/// Aims at `total / (owners + 1)` tokens. Each pick comes from the member
/// currently holding the most, skipping tokens whose ring neighbour was
/// already picked so consecutive ring positions stay on different members.
pub fn suggest_reservations_distributed(assignments: &BTreeMap<Token, String>, member: &str) -> Vec<Token> {
    let ring: Vec<(Token, &str)> = assignments.iter().map(|(t, m)| (*t, m.as_str())).collect();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, owner) in &ring {
        if *owner != member {
            *counts.entry(owner).or_default() += 1;
        }
    }
    if counts.is_empty() {
        return Vec::new();
    }
    let fair = ring.len() / (counts.len() + 1);

    let n = ring.len();
    let mut taken = vec![false; n];
    let mut picks = Vec::with_capacity(fair);
    while picks.len() < fair {
        let Some((&donor, _)) = counts
            .iter()
            .filter(|(_, c)| **c > fair)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            break;
        };
        let owned = |i: &usize| ring[*i].1 == donor && !taken[*i];
        let isolated = |i: &usize| !taken[(i + n - 1) % n] && !taken[(i + 1) % n];
        let choice = (0..n)
            .filter(owned)
            .find(isolated)
            .or_else(|| (0..n).find(owned));
        let Some(i) = choice else { break };
        taken[i] = true;
        picks.push(ring[i].0);
        if let Some(c) = counts.get_mut(donor) {
            *c -= 1;
        }
    }
    picks.sort_unstable();
    picks
}

/// Drives join and removal for one member
pub struct Rebalancer {
    member: String,
    store: SharedMetaStore,
    keys: Keyspace,
    nodes: Arc<NodeCollection>,
    tokens: Arc<TokenStore>,
    resolver: Arc<Resolver>,
    importer: Arc<Importer>,
    hints: HintStore,
    imports: Arc<WorkQueue<ImportTask>>,
    deletes: Arc<WorkQueue<DeleteTask>>,
    virtual_tokens: usize,
}

impl Rebalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member: impl Into<String>,
        store: SharedMetaStore,
        keys: Keyspace,
        nodes: Arc<NodeCollection>,
        tokens: Arc<TokenStore>,
        resolver: Arc<Resolver>,
        importer: Arc<Importer>,
        imports: Arc<WorkQueue<ImportTask>>,
        deletes: Arc<WorkQueue<DeleteTask>>,
    ) -> Self {
        let hints = HintStore::new(store.clone(), keys.clone());
        Self {
            member: member.into(),
            store,
            keys,
            nodes,
            tokens,
            resolver,
            importer,
            hints,
            imports,
            deletes,
            virtual_tokens: crate::config::VIRTUAL_TOKENS,
        }
    }

    pub fn with_virtual_tokens(mut self, count: usize) -> Self {
        self.virtual_tokens = count.max(1);
        self
    }

    fn me(&self) -> Result<Member> {
        self.nodes
            .get(&self.member)
            .ok_or_else(|| RelayError::NotFound(format!("node {} is not registered", self.member)))
    }

    async fn mark_up(&self, tokens: &BTreeSet<Token>) -> Result<()> {
        self.mark(NodeStatus::Up, tokens).await
    }

    async fn mark(&self, status: NodeStatus, tokens: &BTreeSet<Token>) -> Result<()> {
        let mut me = self.me()?;
        me.status = status;
        me.tokens = tokens.clone();
        self.nodes.persist(&me).await
    }

    /// Take this member's place in the ring
    ///
    /// The member must already be registered. Joins are serialised through
    /// the cluster-wide tokens mutex.
    pub async fn join(&self) -> Result<JoinReport> {
        self.me()?;
        let mutex = MetaMutex::new(self.store.clone(), self.keys.tokens_lock(), self.member.clone());
        let guard = mutex.lock().await?;
        let result = self.join_locked().await;
        if let Err(e) = guard.unlock().await {
            warn!(node = %self.member, error = %e, "failed to release tokens mutex");
        }
        result
    }

    async fn join_locked(&self) -> Result<JoinReport> {
        if let Some(tokens) = self.tokens.init_many(&self.member, self.virtual_tokens).await? {
            for token in &tokens {
                self.resolver.add_token(*token, &self.member);
            }
            self.mark_up(&tokens).await?;
            info!(node = %self.member, tokens = tokens.len(), "initialised cluster");
            return Ok(JoinReport {
                first: true,
                tokens,
                delete_tasks: 0,
            });
        }

        let assignments = self.tokens.get_all().await?;
        self.resolver.reset(assignments.clone());

        let owned: BTreeSet<Token> = assignments
            .iter()
            .filter(|(_, m)| **m == self.member)
            .map(|(t, _)| *t)
            .collect();
        if !owned.is_empty() {
            // buffered writes must land before this member serves reads again
            let status = if self.hints.get_by_target(&self.member).await?.is_empty() {
                NodeStatus::Up
            } else {
                NodeStatus::Recovering
            };
            info!(node = %self.member, tokens = owned.len(), status = ?status, "rejoining with existing tokens");
            self.mark(status, &owned).await?;
            return Ok(JoinReport {
                first: false,
                tokens: owned,
                delete_tasks: 0,
            });
        }

        let me = self.me()?;
        let mut reserved = BTreeSet::new();
        for token in suggest_reservations_distributed(&assignments, &self.member) {
            if self.tokens.reserve(token, &self.member).await? {
                reserved.insert(token);
            } else {
                debug!(node = %self.member, token, "token reserved by another member");
            }
        }
        info!(node = %self.member, reserved = reserved.len(), "joining cluster");

        let stats = self.importer.import_partitioned(&reserved, &me).await?;
        debug!(node = %self.member, series = stats.series, points = stats.points, "primary import done");

        let mut old_holders: BTreeMap<Token, BTreeSet<String>> = BTreeMap::new();
        for token in &reserved {
            for t in self.resolver.reverse_secondary_lookup(*token) {
                let holders = old_holders.entry(t).or_default();
                for member in self.resolver.find_nodes_by_key(t, Purpose::Write) {
                    holders.insert(member.name);
                }
            }
        }

        for token in &reserved {
            self.tokens.release(*token).await?;
            self.tokens.assign(*token, &self.member).await?;
            self.resolver.add_token(*token, &self.member);
        }

        let secondary: BTreeSet<Token> = reserved
            .iter()
            .flat_map(|t| self.resolver.reverse_secondary_lookup(*t))
            .filter(|t| !reserved.contains(t))
            .collect();
        let stats = self.importer.import_partitioned(&secondary, &me).await?;
        debug!(node = %self.member, tokens = secondary.len(), points = stats.points, "secondary import done");

        let stats = self.importer.import_non_partitioned(&me).await?;
        debug!(node = %self.member, points = stats.points, "non-partitioned import done");

        let mut delete_tasks = 0;
        for (token, holders) in &old_holders {
            let replicas: BTreeSet<String> = self
                .resolver
                .find_nodes_by_key(*token, Purpose::Write)
                .into_iter()
                .map(|m| m.name)
                .collect();
            for holder in holders {
                if *holder == self.member || replicas.contains(holder) {
                    continue;
                }
                self.deletes.push(holder, DeleteTask { token: *token }).await?;
                delete_tasks += 1;
            }
        }

        self.mark_up(&reserved).await?;
        self.importer.clear_cache();
        info!(node = %self.member, tokens = reserved.len(), delete_tasks, "joined cluster");
        Ok(JoinReport {
            first: false,
            tokens: reserved,
            delete_tasks,
        })
    }

    /// Hand `name`'s tokens to the surviving members
    ///
    /// Marks the member removed, queues one import task per recipient and
    /// discards the hints the removed member was holding.
    pub async fn remove(&self, name: &str) -> Result<RemovalPlan> {
        let mut member = self
            .nodes
            .get(name)
            .ok_or_else(|| RelayError::NotFound(format!("node {} not found", name)))?;
        let survivors: Vec<Member> = self
            .nodes
            .get_all()
            .into_iter()
            .filter(|m| m.name != name && m.status != NodeStatus::Removed)
            .collect();
        if survivors.is_empty() {
            return Err(RelayError::BadRequest(format!(
                "cannot remove {}: no other node to take its tokens",
                name
            )));
        }

        member.status = NodeStatus::Removed;
        self.nodes.persist(&member).await?;

        let owned = self.tokens.tokens_of(name).await?;
        let mut imports: BTreeMap<String, (BTreeSet<Token>, BTreeSet<Token>)> = BTreeMap::new();
        for (i, token) in owned.iter().enumerate() {
            let recipient = &survivors[i % survivors.len()].name;
            let (tokens, reassign) = imports.entry(recipient.clone()).or_default();
            tokens.extend(self.resolver.reverse_secondary_lookup(*token));
            reassign.insert(*token);
        }

        let mut plan = RemovalPlan::default();
        for (recipient, (tokens, reassign)) in imports {
            self.imports
                .push(
                    &recipient,
                    ImportTask {
                        tokens: tokens.into_iter().collect(),
                        reassign: reassign.iter().copied().collect(),
                        reassign_from: Some(name.to_string()),
                    },
                )
                .await?;
            plan.assignments.insert(recipient, reassign);
        }
        plan.hints_cleared = self.hints.delete_by_holder(name).await?;
        info!(
            node = %name,
            tokens = owned.len(),
            recipients = plan.assignments.len(),
            hints_cleared = plan.hints_cleared,
            "node removal scheduled"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MemoryMetaStore, NodeStore};
    use crate::partition::{PartitionKey, Partitioner};
    use crate::queue::WorkType;
    use crate::tsdb::{MemoryCluster, Tsdb, WriteRequest};

    fn assignments(owners: &[(Token, &str)]) -> BTreeMap<Token, String> {
        owners.iter().map(|(t, m)| (*t, m.to_string())).collect()
    }

    #[test]
    fn test_suggest_takes_fair_share_without_neighbours() {
        let ring: BTreeMap<Token, String> = (0..8).map(|i| (i * 100, "a".to_string())).collect();
        let picks = suggest_reservations_distributed(&ring, "c");
        assert_eq!(picks, vec![0, 200, 400, 600]);
    }

    #[test]
    fn test_suggest_prefers_most_loaded() {
        let ring = assignments(&[(10, "a"), (20, "a"), (30, "b"), (40, "a"), (50, "a"), (60, "b")]);
        // fair share is 2, both taken from a
        let picks = suggest_reservations_distributed(&ring, "c");
        assert_eq!(picks.len(), 2);
        assert!(picks.iter().all(|t| ring[t] == "a"));
    }

    #[test]
    fn test_suggest_empty_ring() {
        assert!(suggest_reservations_distributed(&BTreeMap::new(), "c").is_empty());
        let only_me = assignments(&[(1, "c")]);
        assert!(suggest_reservations_distributed(&only_me, "c").is_empty());
    }

    struct Node {
        rebalancer: Rebalancer,
        resolver: Arc<Resolver>,
    }

    struct Fixture {
        meta: SharedMetaStore,
        keys: Keyspace,
        cluster: Arc<MemoryCluster>,
        tokens: Arc<TokenStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let meta: SharedMetaStore = Arc::new(MemoryMetaStore::new());
            let keys = Keyspace::new("/fluxrelay", "t");
            Self {
                tokens: Arc::new(TokenStore::new(meta.clone(), keys.clone())),
                meta,
                keys,
                cluster: Arc::new(MemoryCluster::new()),
            }
        }

        async fn node(&self, name: &str) -> Node {
            let nodes = Arc::new(NodeCollection::new(NodeStore::new(self.meta.clone(), self.keys.clone())));
            nodes.load().await.unwrap();
            nodes
                .persist(&Member::new(name, format!("{}:8086", name)))
                .await
                .unwrap();
            let resolver = Arc::new(Resolver::new(nodes.clone(), 1));
            let partitioner = Arc::new(Partitioner::new());
            partitioner.add_key(PartitionKey::new("sharded", "treasures", vec!["type".into()]));
            let importer = Arc::new(Importer::new(resolver.clone(), partitioner, self.cluster.clone()));
            let rebalancer = Rebalancer::new(
                name,
                self.meta.clone(),
                self.keys.clone(),
                nodes,
                self.tokens.clone(),
                resolver.clone(),
                importer,
                Arc::new(WorkQueue::new(self.meta.clone(), self.keys.clone(), WorkType::Import, name)),
                Arc::new(WorkQueue::new(
                    self.meta.clone(),
                    self.keys.clone(),
                    WorkType::DeleteByToken,
                    name,
                )),
            )
            .with_virtual_tokens(16);
            Node { rebalancer, resolver }
        }
    }

    #[tokio::test]
    async fn test_first_member_initialises_ring() {
        let f = Fixture::new();
        let a = f.node("a").await;
        let report = a.rebalancer.join().await.unwrap();
        assert!(report.first);
        assert_eq!(report.tokens.len(), 16);
        assert_eq!(a.resolver.ring().len(), 16);
        assert_eq!(a.rebalancer.me().unwrap().status, NodeStatus::Up);

        // a restart keeps the tokens
        let again = a.rebalancer.join().await.unwrap();
        assert!(!again.first);
        assert_eq!(again.tokens, report.tokens);
    }

    #[tokio::test]
    async fn test_rejoin_with_hints_stays_unreadable() {
        let f = Fixture::new();
        let a = f.node("a").await;
        a.rebalancer.join().await.unwrap();
        let hints = HintStore::new(f.meta.clone(), f.keys.clone());
        hints.put("a", "b", crate::meta::HintStatus::Waiting).await.unwrap();

        let store = NodeStore::new(f.meta.clone(), f.keys.clone());
        let mut watch = store.watch().await.unwrap();
        a.rebalancer.join().await.unwrap();
        assert_eq!(a.rebalancer.me().unwrap().status, NodeStatus::Recovering);
        // the first status published is already recovering, never up
        let (name, member) = store.decode(&watch.recv().await.unwrap()).unwrap();
        assert_eq!(name, "a");
        assert_eq!(member.unwrap().status, NodeStatus::Recovering);

        hints.done("a", "b").await.unwrap();
        a.rebalancer.join().await.unwrap();
        assert_eq!(a.rebalancer.me().unwrap().status, NodeStatus::Up);
    }

    #[tokio::test]
    async fn test_join_moves_half_and_schedules_deletes() {
        let f = Fixture::new();
        let a = f.node("a").await;
        a.rebalancer.join().await.unwrap();
        let tsdb_a = f.cluster.get("a:8086");
        tsdb_a.query("", "CREATE DATABASE sharded", None).await.unwrap();
        let body: Vec<String> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .enumerate()
            .map(|(i, t)| format!("treasures,type={} value={} {}", t, i, i + 1))
            .collect();
        tsdb_a
            .write(&WriteRequest::new("sharded", body.join("\n")))
            .await
            .unwrap();

        let c = f.node("c").await;
        c.rebalancer.nodes.load().await.unwrap();
        let report = c.rebalancer.join().await.unwrap();
        assert!(!report.first);
        assert_eq!(report.tokens.len(), 8);
        assert_eq!(c.rebalancer.me().unwrap().status, NodeStatus::Up);
        assert!(f.tokens.reserved().await.unwrap().is_empty());

        let owned = f.tokens.get_all().await.unwrap();
        assert_eq!(owned.values().filter(|m| *m == "c").count(), 8);

        // every point whose primary moved to c was copied
        let moved = f
            .cluster
            .get("c:8086")
            .points("sharded")
            .into_iter()
            .map(|p| p.key.tags["type"].clone())
            .collect::<BTreeSet<_>>();
        for point in tsdb_a.points("sharded") {
            let hash = crate::hash::hash_str(&point.key.tags["type"]);
            let owner = c.resolver.ring().get(hash).unwrap().member;
            assert_eq!(owner == "c", moved.contains(&point.key.tags["type"]));
        }
        let pending = WorkQueue::<DeleteTask>::new(f.meta.clone(), f.keys.clone(), WorkType::DeleteByToken, "x")
            .pending("a")
            .await
            .unwrap();
        assert_eq!(pending.len(), report.delete_tasks);
        assert_eq!(report.delete_tasks, 8);
    }

    #[tokio::test]
    async fn test_remove_distributes_tokens() {
        let f = Fixture::new();
        let a = f.node("a").await;
        a.rebalancer.join().await.unwrap();
        let b = f.node("b").await;
        b.rebalancer.nodes.load().await.unwrap();
        b.rebalancer.join().await.unwrap();
        a.rebalancer.nodes.load().await.unwrap();
        HintStore::new(f.meta.clone(), f.keys.clone())
            .put("a", "b", crate::meta::HintStatus::Waiting)
            .await
            .unwrap();

        let plan = a.rebalancer.remove("b").await.unwrap();
        assert_eq!(plan.assignments.len(), 1);
        assert_eq!(plan.assignments["a"].len(), 8);
        assert_eq!(plan.hints_cleared, 1);
        assert_eq!(a.rebalancer.nodes.get("b").unwrap().status, NodeStatus::Removed);

        let tasks = WorkQueue::<ImportTask>::new(f.meta.clone(), f.keys.clone(), WorkType::Import, "x")
            .pending("a")
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload.reassign_from.as_deref(), Some("b"));

        assert!(matches!(
            a.rebalancer.remove("nobody").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_remove_last_node() {
        let f = Fixture::new();
        let a = f.node("a").await;
        a.rebalancer.join().await.unwrap();
        assert!(matches!(a.rebalancer.remove("a").await, Err(RelayError::BadRequest(_))));
    }
}
