//! Metadata store gateway
//!
//! The cluster's source of truth lives in a linearizable key-value store
//! with watch, lease and mutex primitives. This module defines the store
//! interface, the cluster keyspace and typed views over it:
//!
//! - `nodes/<name>` - JSON member
//! - `tokens/<token>` - owning member name
//! - `reservedTokens/<token>` - reserving member name, lease-backed
//! - `partitionKeys/<db>.<measurement>/` - JSON partition key
//! - `hints/<target>/<holder>` - decimal hint status
//! - `settings/rf_default`, `settings/rf/<db>.<measurement>` - decimal integers
//! - `auth` - JSON auth blob
//! - `tasks/pending/<type>/<target>/<id>` - JSON task
//!
//! Every path is namespaced under `<base>/<cluster-id>/`.

pub mod http;
pub mod memory;
pub mod mutex;
pub mod stores;

pub use http::HttpMetaStore;
pub use memory::MemoryMetaStore;
pub use mutex::{MetaMutex, MutexGuard};
pub use stores::{HintStatus, HintStore, NodeStore, PartitionKeyStore, SettingsStore, TokenStore};

use crate::{RelayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lease identifier
pub type LeaseId = i64;

/// A stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value for puts, last value for deletes
    pub value: String,
    pub revision: u64,
}

/// Receiving half of a watch; dropping it cancels the watch
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Shared handle to a metadata store
pub type SharedMetaStore = Arc<dyn MetaStore>;

/// Metadata store interface
///
/// Implementations must be linearizable: `create` is an atomic
/// put-if-absent and watches observe changes in revision order.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Value of a single key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Every pair whose key starts with `prefix`, ordered by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Unconditional write, optionally attached to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Write iff the key is absent; returns whether the write happened
    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key under `prefix`; returns the number deleted
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Stream of changes under `prefix` from now on
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Grant a lease that expires after `ttl` unless kept alive
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease to its full TTL
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Current store revision
    async fn revision(&self) -> Result<u64>;
}

/// Path builder for one cluster's keyspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    root: String,
}

impl Keyspace {
    /// Keyspace `<base>/<cluster_id>/`
    pub fn new(base: &str, cluster_id: &str) -> Self {
        Self {
            root: format!("{}/{}/", base.trim_end_matches('/'), cluster_id),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn nodes(&self) -> String {
        format!("{}nodes/", self.root)
    }

    pub fn node(&self, name: &str) -> String {
        format!("{}{}", self.nodes(), name)
    }

    pub fn tokens(&self) -> String {
        format!("{}tokens/", self.root)
    }

    pub fn token(&self, token: crate::Token) -> String {
        format!("{}{}", self.tokens(), token)
    }

    /// Mutex serialising token initialisation and joins
    pub fn tokens_lock(&self) -> String {
        format!("{}lock", self.tokens())
    }

    pub fn reserved_tokens(&self) -> String {
        format!("{}reservedTokens/", self.root)
    }

    pub fn reserved_token(&self, token: crate::Token) -> String {
        format!("{}{}", self.reserved_tokens(), token)
    }

    pub fn partition_keys(&self) -> String {
        format!("{}partitionKeys/", self.root)
    }

    pub fn partition_key(&self, id: &str) -> String {
        format!("{}{}/", self.partition_keys(), id)
    }

    pub fn hints(&self) -> String {
        format!("{}hints/", self.root)
    }

    /// Prefix listing every holder with data for `target`
    pub fn hints_for(&self, target: &str) -> String {
        format!("{}{}/", self.hints(), target)
    }

    pub fn hint(&self, target: &str, holder: &str) -> String {
        format!("{}{}", self.hints_for(target), holder)
    }

    pub fn settings(&self) -> String {
        format!("{}settings/", self.root)
    }

    pub fn setting(&self, key: &str) -> String {
        format!("{}{}", self.settings(), key)
    }

    pub fn auth(&self) -> String {
        format!("{}auth", self.root)
    }

    pub fn tasks_pending(&self, work_type: &str, target: &str) -> String {
        format!("{}tasks/pending/{}/{}/", self.root, work_type, target)
    }

    pub fn task(&self, work_type: &str, target: &str, id: &str) -> String {
        format!("{}{}", self.tasks_pending(work_type, target), id)
    }

    pub fn task_lock(&self, work_type: &str, target: &str) -> String {
        format!("{}tasks/lock/{}/{}", self.root, work_type, target)
    }
}

/// Strip `prefix` from `key`, failing loudly on foreign keys
pub(crate) fn suffix<'a>(key: &'a str, prefix: &str) -> Result<&'a str> {
    key.strip_prefix(prefix)
        .ok_or_else(|| RelayError::Meta(format!("key {} outside prefix {}", key, prefix)))
}

/// Open the metadata store named by an endpoint list
///
/// `memory://` yields a fresh in-process store; `http://host:port` (comma
/// separated for several endpoints) yields the client of the `/meta/v1`
/// service. Bare `host:port` endpoints, as given to etcd clients, are
/// refused since no etcd protocol is spoken.
pub fn connect(endpoints: &str) -> Result<SharedMetaStore> {
    let endpoints: Vec<String> = endpoints
        .split(',')
        .map(|e| e.trim().trim_end_matches('/').to_string())
        .filter(|e| !e.is_empty())
        .collect();
    match endpoints.first().map(String::as_str) {
        None => Err(RelayError::BadRequest("no metadata endpoints given".into())),
        Some(e) if e.starts_with("memory://") => Ok(Arc::new(MemoryMetaStore::new())),
        Some(_) => {
            if let Some(bad) = endpoints
                .iter()
                .find(|e| !e.starts_with("http://") && !e.starts_with("https://"))
            {
                return Err(RelayError::BadRequest(format!(
                    "metadata endpoint {} must be memory:// or the http(s):// address of a member serving /meta/v1",
                    bad
                )));
            }
            Ok(Arc::new(HttpMetaStore::new(endpoints)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let ks = Keyspace::new("/fluxrelay/", "c1");
        assert_eq!(ks.root(), "/fluxrelay/c1/");
        assert_eq!(ks.node("n1"), "/fluxrelay/c1/nodes/n1");
        assert_eq!(ks.token(42), "/fluxrelay/c1/tokens/42");
        assert_eq!(ks.reserved_token(5), "/fluxrelay/c1/reservedTokens/5");
        assert_eq!(ks.partition_key("db.m"), "/fluxrelay/c1/partitionKeys/db.m/");
        assert_eq!(ks.hint("b", "a"), "/fluxrelay/c1/hints/b/a");
        assert_eq!(ks.setting("rf_default"), "/fluxrelay/c1/settings/rf_default");
        assert_eq!(
            ks.task("import", "n2", "t1"),
            "/fluxrelay/c1/tasks/pending/import/n2/t1"
        );
        assert_eq!(ks.task_lock("import", "n2"), "/fluxrelay/c1/tasks/lock/import/n2");
    }

    #[test]
    fn test_connect_selects_backend() {
        assert!(connect("memory://").is_ok());
        assert!(connect("").is_err());
        assert!(connect("http://m1:7076, http://m2:7076/").is_ok());
        assert!(matches!(connect("localhost:2379"), Err(RelayError::BadRequest(_))));
        assert!(matches!(
            connect("http://m1:7076,m2:2379"),
            Err(RelayError::BadRequest(_))
        ));
    }
}
