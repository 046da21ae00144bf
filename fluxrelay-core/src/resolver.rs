//! Resolver
//!
//! Maps a ring key to the ordered set of members hosting it. The ring stores
//! member names; every lookup resolves them through the node collection so
//! the returned members always carry current status and location.

use crate::meta::{SettingsStore, TokenStore};
use crate::nodes::NodeCollection;
use crate::ring::Ring;
use crate::{Member, NodeStatus, Result, Token};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a lookup is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Only members that are up
    Read,
    /// Every status, so joining and recovering members accumulate writes
    Write,
}

/// Replica lookups over the partition ring
pub struct Resolver {
    ring: Ring,
    nodes: Arc<NodeCollection>,
    /// Used when no settings store is attached
    replication_factor: usize,
    settings: Option<Arc<SettingsStore>>,
    /// Serialises ring writers
    write_lock: Mutex<()>,
}

impl Resolver {
    pub fn new(nodes: Arc<NodeCollection>, replication_factor: usize) -> Self {
        Self {
            ring: Ring::new(),
            nodes,
            replication_factor: replication_factor.max(1),
            settings: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn nodes(&self) -> &Arc<NodeCollection> {
        &self.nodes
    }

    /// Follow the cluster settings instead of the fixed factor
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Largest replication factor in force anywhere in the cluster
    ///
    /// Token-level lookups cannot tell which measurement they serve, so
    /// they walk this many replicas; data is never dropped from a member
    /// that some partition still replicates to.
    pub fn replication_factor(&self) -> usize {
        match &self.settings {
            Some(settings) => settings.max_rf(),
            None => self.replication_factor,
        }
    }

    /// Replication factor of one `(database, measurement)`
    pub fn replication_factor_for(&self, database: &str, measurement: &str) -> usize {
        match &self.settings {
            Some(settings) => settings.rf(database, measurement),
            None => self.replication_factor,
        }
    }

    fn admit(member: &Member, purpose: Purpose) -> bool {
        match purpose {
            Purpose::Read => member.status == NodeStatus::Up,
            Purpose::Write => true,
        }
    }

    /// Distinct members hosting `key` with the largest replication factor
    pub fn find_nodes_by_key(&self, key: Token, purpose: Purpose) -> Vec<Member> {
        self.find_nodes_by_key_n(key, self.replication_factor(), purpose)
    }

    /// Distinct members hosting `key`, first entry is the primary
    pub fn find_nodes_by_key_n(&self, key: Token, n: usize, purpose: Purpose) -> Vec<Member> {
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        for partition in self.ring.get_multi(key, n.max(1)) {
            if !seen.insert(partition.member.clone()) {
                continue;
            }
            let Some(member) = self.nodes.get(&partition.member) else {
                debug!(member = %partition.member, token = partition.token, "ring member not in node collection");
                continue;
            };
            if Self::admit(&member, purpose) {
                members.push(member);
            }
        }
        members
    }

    /// Owner of the partition directly responsible for `key`
    pub fn find_primary(&self, key: Token) -> Option<Member> {
        let partition = self.ring.get(key)?;
        self.nodes.get(&partition.member)
    }

    /// Every token whose replica walk includes `token`
    ///
    /// `token` itself plus up to `rf - 1` predecessors; with a single
    /// replica this is just `{token}`.
    pub fn reverse_secondary_lookup(&self, token: Token) -> BTreeSet<Token> {
        let mut tokens: BTreeSet<Token> = self
            .ring
            .predecessors(token, self.replication_factor() - 1)
            .into_iter()
            .collect();
        tokens.insert(token);
        tokens
    }

    /// One member per distinct data location, readable members only
    pub fn find_all(&self) -> Vec<Member> {
        let mut locations = HashSet::new();
        self.nodes
            .get_all()
            .into_iter()
            .filter(|m| m.is_readable())
            .filter(|m| locations.insert(m.location.clone()))
            .collect()
    }

    pub fn add_token(&self, token: Token, member: &str) {
        let _guard = self.write_lock.lock();
        self.ring.put(token, member);
    }

    pub fn remove_token(&self, token: Token) {
        let _guard = self.write_lock.lock();
        self.ring.remove(token);
    }

    /// Drop every token owned by `member`
    pub fn remove_all_tokens(&self, member: &str) {
        let _guard = self.write_lock.lock();
        for token in self.ring.tokens_of(member) {
            self.ring.remove(token);
        }
    }

    /// Replace the ring with a snapshot of assignments
    pub fn reset(&self, assignments: impl IntoIterator<Item = (Token, String)>) {
        let _guard = self.write_lock.lock();
        self.ring.clear();
        for (token, member) in assignments {
            self.ring.put(token, member);
        }
    }
}

/// Keeps a resolver's ring in step with the token assignments in the store
pub struct ResolverSyncer {
    resolver: Arc<Resolver>,
    tokens: Arc<TokenStore>,
}

impl ResolverSyncer {
    pub fn new(resolver: Arc<Resolver>, tokens: Arc<TokenStore>) -> Self {
        Self { resolver, tokens }
    }

    /// Snapshot the assignments into the ring
    pub async fn snapshot(&self) -> Result<()> {
        let assignments = self.tokens.get_all().await?;
        info!(tokens = assignments.len(), "ring snapshot loaded");
        self.resolver.reset(assignments);
        Ok(())
    }

    /// Snapshot, then apply watch events until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.tokens.watch().await?;
        self.snapshot().await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = watch.recv() => {
                    let Some(event) = event else {
                        warn!("token watch closed; resyncing");
                        watch = self.tokens.watch().await?;
                        self.snapshot().await?;
                        continue;
                    };
                    match self.tokens.decode(&event) {
                        Some((token, Some(member))) => self.resolver.add_token(token, &member),
                        Some((token, None)) => self.resolver.remove_token(token),
                        None => {}
                    }
                }
            }
        }
    }
}
