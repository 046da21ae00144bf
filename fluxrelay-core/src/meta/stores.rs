//! Typed views over the metadata keyspace

use super::{suffix, KeyValue, Keyspace, LeaseId, SharedMetaStore, WatchEvent, WatchEventKind, WatchStream};
use crate::config::{DEFAULT_REPLICATION_FACTOR, RESERVATION_TTL};
use crate::partition::PartitionKey;
use crate::{Member, RelayError, Result, Token};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

fn decode_json<T: serde::de::DeserializeOwned>(kv_key: &str, value: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| RelayError::Meta(format!("undecodable value at {}: {}", kv_key, e)))
}

/// `nodes/<name>` → JSON member
#[derive(Clone)]
pub struct NodeStore {
    store: SharedMetaStore,
    keys: Keyspace,
}

impl NodeStore {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Member>> {
        let key = self.keys.node(name);
        match self.store.get(&key).await? {
            Some(v) => Ok(Some(decode_json(&key, &v)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Member>> {
        self.store
            .get_prefix(&self.keys.nodes())
            .await?
            .iter()
            .map(|kv| decode_json(&kv.key, &kv.value))
            .collect()
    }

    pub async fn persist(&self, member: &Member) -> Result<()> {
        let value = serde_json::to_string(member)?;
        self.store.put(&self.keys.node(&member.name), &value, None).await
    }

    /// Returns whether the member existed
    pub async fn remove(&self, name: &str) -> Result<bool> {
        self.store.delete(&self.keys.node(name)).await
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.store.watch(&self.keys.nodes()).await
    }

    /// Decode a watch event into `(name, member)`; `None` member on delete
    pub fn decode(&self, event: &WatchEvent) -> Result<(String, Option<Member>)> {
        let name = suffix(&event.key, &self.keys.nodes())?.to_string();
        match event.kind {
            WatchEventKind::Put => Ok((name, Some(decode_json(&event.key, &event.value)?))),
            WatchEventKind::Delete => Ok((name, None)),
        }
    }
}

/// Token assignments and lease-backed reservations
pub struct TokenStore {
    store: SharedMetaStore,
    keys: Keyspace,
    /// Lease shared by this process's reservations
    reservation_lease: Mutex<Option<LeaseId>>,
}

impl TokenStore {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            reservation_lease: Mutex::new(None),
        }
    }

    fn parse_token(&self, key: &str, prefix: &str) -> Option<Token> {
        key.strip_prefix(prefix).and_then(|t| t.parse().ok())
    }

    /// Every assignment, token ascending
    pub async fn get_all(&self) -> Result<BTreeMap<Token, String>> {
        let prefix = self.keys.tokens();
        Ok(self
            .store
            .get_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|kv| Some((self.parse_token(&kv.key, &prefix)?, kv.value)))
            .collect())
    }

    /// Tokens assigned to `member`
    pub async fn tokens_of(&self, member: &str) -> Result<BTreeSet<Token>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|(_, m)| m == member)
            .map(|(t, _)| t)
            .collect())
    }

    pub async fn assign(&self, token: Token, member: &str) -> Result<()> {
        debug!(token, member, "assigning token");
        self.store.put(&self.keys.token(token), member, None).await
    }

    /// Drop an assignment
    pub async fn unassign(&self, token: Token) -> Result<bool> {
        self.store.delete(&self.keys.token(token)).await
    }

    /// Drop every assignment held by `member`
    pub async fn remove_all(&self, member: &str) -> Result<usize> {
        let mut removed = 0;
        for token in self.tokens_of(member).await? {
            if self.unassign(token).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Take `count` random tokens iff the cluster has no assignments yet
    ///
    /// Callers hold the tokens mutex, which makes check-then-write atomic.
    /// Returns `None` when this member is not the first.
    pub async fn init_many(&self, member: &str, count: usize) -> Result<Option<BTreeSet<Token>>> {
        if !self.get_all().await?.is_empty() {
            return Ok(None);
        }
        let mut tokens = BTreeSet::new();
        let mut rng = rand::thread_rng();
        while tokens.len() < count {
            tokens.insert(rng.gen::<Token>());
        }
        for token in &tokens {
            self.assign(*token, member).await?;
        }
        info!(member, count, "initialised cluster tokens");
        Ok(Some(tokens))
    }

    async fn lease(&self) -> Result<LeaseId> {
        if let Some(lease) = *self.reservation_lease.lock() {
            return Ok(lease);
        }
        let lease = self.store.grant_lease(RESERVATION_TTL).await?;
        let mut slot = self.reservation_lease.lock();
        match *slot {
            Some(existing) => Ok(existing),
            None => {
                *slot = Some(lease);
                Ok(lease)
            }
        }
    }

    /// Claim exclusive import rights to `token`
    ///
    /// Succeeds when the reservation was created or already belongs to
    /// `member`; fails when another member holds it.
    pub async fn reserve(&self, token: Token, member: &str) -> Result<bool> {
        let key = self.keys.reserved_token(token);
        let lease = self.lease().await?;
        let created = match self.store.create(&key, member, Some(lease)).await {
            Ok(created) => created,
            Err(_) => {
                // the shared lease lapsed; take a fresh one
                *self.reservation_lease.lock() = None;
                let lease = self.lease().await?;
                self.store.create(&key, member, Some(lease)).await?
            }
        };
        if created {
            return Ok(true);
        }
        Ok(self.store.get(&key).await?.as_deref() == Some(member))
    }

    /// Drop a reservation
    pub async fn release(&self, token: Token) -> Result<bool> {
        self.store.delete(&self.keys.reserved_token(token)).await
    }

    /// Every reservation, token ascending
    pub async fn reserved(&self) -> Result<BTreeMap<Token, String>> {
        let prefix = self.keys.reserved_tokens();
        Ok(self
            .store
            .get_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|kv| Some((self.parse_token(&kv.key, &prefix)?, kv.value)))
            .collect())
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.store.watch(&self.keys.tokens()).await
    }

    /// Decode a watch event into `(token, owner)`; `None` owner on delete.
    /// Non-token keys under the prefix (the tokens mutex) yield `None`.
    pub fn decode(&self, event: &WatchEvent) -> Option<(Token, Option<String>)> {
        let token = self.parse_token(&event.key, &self.keys.tokens())?;
        match event.kind {
            WatchEventKind::Put => Some((token, Some(event.value.clone()))),
            WatchEventKind::Delete => Some((token, None)),
        }
    }
}

/// `partitionKeys/<id>/` → JSON partition key
#[derive(Clone)]
pub struct PartitionKeyStore {
    store: SharedMetaStore,
    keys: Keyspace,
}

impl PartitionKeyStore {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn get_all(&self) -> Result<Vec<PartitionKey>> {
        self.store
            .get_prefix(&self.keys.partition_keys())
            .await?
            .iter()
            .map(|kv| decode_json(&kv.key, &kv.value))
            .collect()
    }

    /// Store a new key; `Conflict` when one already exists for its id
    pub async fn create(&self, key: &PartitionKey) -> Result<()> {
        let value = serde_json::to_string(key)?;
        if self
            .store
            .create(&self.keys.partition_key(&key.id()), &value, None)
            .await?
        {
            Ok(())
        } else {
            Err(RelayError::Conflict(format!(
                "partition key already exists on {}",
                key.id()
            )))
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(&self.keys.partition_key(id)).await
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.store.watch(&self.keys.partition_keys()).await
    }

    /// Decode a watch event into `(id, key)`; `None` key on delete
    pub fn decode(&self, event: &WatchEvent) -> Result<(String, Option<PartitionKey>)> {
        let id = suffix(&event.key, &self.keys.partition_keys())?
            .trim_end_matches('/')
            .to_string();
        match event.kind {
            WatchEventKind::Put => Ok((id, Some(decode_json(&event.key, &event.value)?))),
            WatchEventKind::Delete => Ok((id, None)),
        }
    }
}

/// State of a hint as stored under `hints/<target>/<holder>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HintStatus {
    Waiting = 0,
    Recovering = 1,
}

impl HintStatus {
    fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(HintStatus::Waiting),
            "1" => Ok(HintStatus::Recovering),
            other => Err(RelayError::Meta(format!("invalid hint status {}", other))),
        }
    }
}

/// `hints/<target>/<holder>` → status
#[derive(Clone)]
pub struct HintStore {
    store: SharedMetaStore,
    keys: Keyspace,
}

impl HintStore {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn put(&self, target: &str, holder: &str, status: HintStatus) -> Result<()> {
        let value = (status as u8).to_string();
        self.store.put(&self.keys.hint(target, holder), &value, None).await
    }

    /// Holders with buffered data for `target`
    pub async fn get_by_target(&self, target: &str) -> Result<Vec<(String, HintStatus)>> {
        let prefix = self.keys.hints_for(target);
        self.store
            .get_prefix(&prefix)
            .await?
            .iter()
            .map(|kv| Ok((suffix(&kv.key, &prefix)?.to_string(), HintStatus::parse(&kv.value)?)))
            .collect()
    }

    /// Targets `holder` has buffered data for
    pub async fn get_by_holder(&self, holder: &str) -> Result<Vec<String>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|(_, h)| h == holder)
            .map(|(t, _)| t)
            .collect())
    }

    /// Every `(target, holder)` pair
    pub async fn all(&self) -> Result<Vec<(String, String)>> {
        let prefix = self.keys.hints();
        let kvs: Vec<KeyValue> = self.store.get_prefix(&prefix).await?;
        Ok(kvs
            .iter()
            .filter_map(|kv| self.split(&kv.key))
            .collect())
    }

    /// Remove a hint once the holder has replayed it
    pub async fn done(&self, target: &str, holder: &str) -> Result<bool> {
        self.store.delete(&self.keys.hint(target, holder)).await
    }

    /// Remove every hint held by `holder`
    pub async fn delete_by_holder(&self, holder: &str) -> Result<usize> {
        let mut removed = 0;
        for target in self.get_by_holder(holder).await? {
            if self.done(&target, holder).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.store.watch(&self.keys.hints()).await
    }

    /// `(target, holder)` of a hint key
    pub fn split(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.keys.hints())?;
        let (target, holder) = rest.split_once('/')?;
        Some((target.to_string(), holder.to_string()))
    }
}

const RF_DEFAULT: &str = "rf_default";
const RF_PREFIX: &str = "rf/";

/// `settings/<key>` with a local cache kept current by `apply`
pub struct SettingsStore {
    store: SharedMetaStore,
    keys: Keyspace,
    cache: RwLock<HashMap<String, String>>,
}

impl SettingsStore {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reload the cache from the store
    pub async fn load(&self) -> Result<()> {
        let prefix = self.keys.settings();
        let kvs = self.store.get_prefix(&prefix).await?;
        let mut cache = HashMap::new();
        for kv in kvs {
            cache.insert(suffix(&kv.key, &prefix)?.to_string(), kv.value);
        }
        *self.cache.write() = cache;
        Ok(())
    }

    pub async fn watch(&self) -> Result<WatchStream> {
        self.store.watch(&self.keys.settings()).await
    }

    /// Apply a watch event to the cache
    pub fn apply(&self, event: &WatchEvent) {
        let prefix = self.keys.settings();
        let Some(name) = event.key.strip_prefix(prefix.as_str()) else {
            return;
        };
        let mut cache = self.cache.write();
        match event.kind {
            WatchEventKind::Put => {
                cache.insert(name.to_string(), event.value.clone());
            }
            WatchEventKind::Delete => {
                cache.remove(name);
            }
        }
    }

    fn cached_usize(&self, name: &str) -> Option<usize> {
        self.cache.read().get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn rf_default(&self) -> usize {
        self.cached_usize(RF_DEFAULT)
            .unwrap_or(DEFAULT_REPLICATION_FACTOR)
            .max(1)
    }

    /// Replication factor for a partition id, falling back to the database
    /// override and then the default
    pub fn rf(&self, database: &str, measurement: &str) -> usize {
        let exact = format!("{}{}.{}", RF_PREFIX, database, measurement);
        let db = format!("{}{}.", RF_PREFIX, database);
        self.cached_usize(&exact)
            .or_else(|| self.cached_usize(&db))
            .unwrap_or_else(|| self.rf_default())
            .max(1)
    }

    /// Largest replication factor in force for any partition
    pub fn max_rf(&self) -> usize {
        let overrides = self
            .cache
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(RF_PREFIX))
            .filter_map(|(_, v)| v.trim().parse::<usize>().ok())
            .max()
            .unwrap_or(0);
        overrides.max(self.rf_default())
    }

    pub async fn set_rf_default(&self, rf: usize) -> Result<()> {
        self.set(RF_DEFAULT, &rf.to_string()).await
    }

    pub async fn set_rf(&self, id: &str, rf: usize) -> Result<()> {
        self.set(&format!("{}{}", RF_PREFIX, id), &rf.to_string()).await
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.store.put(&self.keys.setting(name), value, None).await?;
        self.cache.write().insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MemoryMetaStore, MetaStore};
    use crate::NodeStatus;
    use std::sync::Arc;

    fn setup() -> (SharedMetaStore, Keyspace) {
        (Arc::new(MemoryMetaStore::new()), Keyspace::new("/fluxrelay", "test"))
    }

    #[tokio::test]
    async fn test_node_store_round_trip() {
        let (store, keys) = setup();
        let nodes = NodeStore::new(store, keys);
        let mut watch = nodes.watch().await.unwrap();

        let member = Member::new("n1", "localhost:8086").with_status(NodeStatus::Up);
        nodes.persist(&member).await.unwrap();
        assert_eq!(nodes.get("n1").await.unwrap(), Some(member.clone()));
        assert_eq!(nodes.get_all().await.unwrap().len(), 1);

        let (name, decoded) = nodes.decode(&watch.recv().await.unwrap()).unwrap();
        assert_eq!(name, "n1");
        assert_eq!(decoded, Some(member));

        assert!(nodes.remove("n1").await.unwrap());
        assert!(!nodes.remove("n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reservation_exclusivity_and_idempotence() {
        let (store, keys) = setup();
        let p1 = TokenStore::new(store.clone(), keys.clone());
        let p2 = TokenStore::new(store, keys);

        assert!(p1.reserve(5, "foo").await.unwrap());
        assert!(p1.reserve(5, "foo").await.unwrap());
        assert!(!p2.reserve(5, "bar").await.unwrap());
        assert!(p1.release(5).await.unwrap());
        assert!(p2.reserve(5, "bar").await.unwrap());
        assert_eq!(p1.reserved().await.unwrap().get(&5).map(String::as_str), Some("bar"));
    }

    #[tokio::test]
    async fn test_init_many_only_first() {
        let (store, keys) = setup();
        let tokens = TokenStore::new(store, keys);
        let first = tokens.init_many("a", 16).await.unwrap().unwrap();
        assert_eq!(first.len(), 16);
        assert!(tokens.init_many("b", 16).await.unwrap().is_none());
        assert_eq!(tokens.tokens_of("a").await.unwrap(), first);

        assert_eq!(tokens.remove_all("a").await.unwrap(), 16);
        assert!(tokens.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_watch_skips_lock_key() {
        let (store, keys) = setup();
        let tokens = TokenStore::new(store.clone(), keys.clone());
        let mut watch = tokens.watch().await.unwrap();
        store.put(&keys.tokens_lock(), "a", None).await.unwrap();
        tokens.assign(7, "a").await.unwrap();

        assert!(tokens.decode(&watch.recv().await.unwrap()).is_none());
        assert_eq!(
            tokens.decode(&watch.recv().await.unwrap()),
            Some((7, Some("a".to_string())))
        );
    }

    #[tokio::test]
    async fn test_partition_key_conflict() {
        let (store, keys) = setup();
        let pks = PartitionKeyStore::new(store, keys);
        let key = PartitionKey::new("test_db", "", vec!["server_id".into()]);
        pks.create(&key).await.unwrap();
        assert!(matches!(pks.create(&key).await, Err(RelayError::Conflict(_))));
        assert_eq!(pks.get_all().await.unwrap(), vec![key]);
        assert!(pks.delete("test_db.").await.unwrap());
    }

    #[tokio::test]
    async fn test_hints() {
        let (store, keys) = setup();
        let hints = HintStore::new(store, keys);
        hints.put("b", "a", HintStatus::Waiting).await.unwrap();
        hints.put("c", "a", HintStatus::Waiting).await.unwrap();
        hints.put("b", "d", HintStatus::Recovering).await.unwrap();

        let for_b = hints.get_by_target("b").await.unwrap();
        assert_eq!(
            for_b,
            vec![("a".to_string(), HintStatus::Waiting), ("d".to_string(), HintStatus::Recovering)]
        );
        assert_eq!(hints.get_by_holder("a").await.unwrap(), vec!["b", "c"]);

        assert_eq!(hints.delete_by_holder("a").await.unwrap(), 2);
        assert_eq!(hints.all().await.unwrap(), vec![("b".to_string(), "d".to_string())]);
    }

    #[tokio::test]
    async fn test_settings_fallbacks() {
        let (store, keys) = setup();
        let settings = SettingsStore::new(store.clone(), keys.clone());
        assert_eq!(settings.rf_default(), 1);

        settings.set_rf_default(2).await.unwrap();
        settings.set_rf("db.cpu", 3).await.unwrap();
        assert_eq!(settings.rf("db", "cpu"), 3);
        assert_eq!(settings.rf("db", "mem"), 2);

        // a peer's cache converges through watch events
        let peer = SettingsStore::new(store.clone(), keys.clone());
        peer.load().await.unwrap();
        assert_eq!(peer.rf("db", "cpu"), 3);
        let mut watch = peer.watch().await.unwrap();
        store.put(&keys.setting("rf/db."), "4", None).await.unwrap();
        peer.apply(&watch.recv().await.unwrap());
        assert_eq!(peer.rf("db", "mem"), 4);
    }
}
