//! Cluster administration statements
//!
//! Partition keys, node listing and removal, replication factors. Parsed
//! by a keyword trie and answered with the same series shape as `/query`.

mod parser;

pub use parser::parse_admin;

use crate::auth::User;
use crate::meta::{PartitionKeyStore, SettingsStore};
use crate::nodes::NodeCollection;
use crate::partition::{key_id, PartitionKey, Partitioner};
use crate::rebalance::Rebalancer;
use crate::tsdb::Series;
use crate::{RelayError, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// A parsed admin statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminStatement {
    ShowPartitionKeys {
        database: Option<String>,
    },
    CreatePartitionKey {
        database: String,
        /// Empty for a database-wide key
        measurement: String,
        tags: Vec<String>,
    },
    DropPartitionKey {
        database: String,
        measurement: String,
    },
    ShowNodes,
    RemoveNode {
        name: String,
    },
    /// `target: None` sets the cluster default
    SetReplicationFactor {
        factor: usize,
        target: Option<(String, String)>,
    },
}

/// Runs admin statements against the metadata store
pub struct AdminExecutor {
    partition_keys: PartitionKeyStore,
    partitioner: Arc<Partitioner>,
    nodes: Arc<NodeCollection>,
    settings: Arc<SettingsStore>,
    rebalancer: Option<Arc<Rebalancer>>,
    auth_enabled: bool,
}

impl AdminExecutor {
    pub fn new(
        partition_keys: PartitionKeyStore,
        partitioner: Arc<Partitioner>,
        nodes: Arc<NodeCollection>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            partition_keys,
            partitioner,
            nodes,
            settings,
            rebalancer: None,
            auth_enabled: false,
        }
    }

    /// Enable `REMOVE NODE`
    pub fn with_rebalancer(mut self, rebalancer: Arc<Rebalancer>) -> Self {
        self.rebalancer = Some(rebalancer);
        self
    }

    /// Require an admin user for every statement
    pub fn with_auth_enabled(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub async fn execute(&self, statement: &AdminStatement, user: Option<&User>) -> Result<Vec<Series>> {
        if self.auth_enabled {
            match user {
                None => return Err(RelayError::Unauthorized("no user provided".into())),
                Some(u) if !u.admin => {
                    return Err(RelayError::Forbidden(format!(
                        "{} not authorized to run cluster administration",
                        u.name
                    )))
                }
                Some(_) => {}
            }
        }

        match statement {
            AdminStatement::ShowPartitionKeys { database } => self.show_partition_keys(database.as_deref()).await,
            AdminStatement::CreatePartitionKey {
                database,
                measurement,
                tags,
            } => {
                let key = PartitionKey::new(database.clone(), measurement.clone(), tags.clone());
                self.partition_keys.create(&key).await?;
                info!(key = %key.id(), tags = ?key.tags, "partition key created");
                self.partitioner.add_key(key);
                Ok(Vec::new())
            }
            AdminStatement::DropPartitionKey { database, measurement } => {
                let id = key_id(database, measurement);
                if !self.partition_keys.delete(&id).await? {
                    return Err(RelayError::NotFound(format!("partition key not found: {}", id)));
                }
                self.partitioner.remove_key(&id);
                info!(key = %id, "partition key dropped");
                Ok(Vec::new())
            }
            AdminStatement::ShowNodes => Ok(vec![self.show_nodes()]),
            AdminStatement::RemoveNode { name } => {
                let rebalancer = self
                    .rebalancer
                    .as_ref()
                    .ok_or_else(|| RelayError::Unsupported("node removal is not available on this node".into()))?;
                let plan = rebalancer.remove(name).await?;
                let mut series = Series::new("", &["recipient", "tokens"]);
                for (recipient, tokens) in plan.assignments {
                    series
                        .values
                        .push(vec![Value::from(recipient), Value::from(tokens.len())]);
                }
                Ok(vec![series])
            }
            AdminStatement::SetReplicationFactor { factor, target } => {
                match target {
                    None => self.settings.set_rf_default(*factor).await?,
                    Some((database, measurement)) => {
                        self.settings.set_rf(&key_id(database, measurement), *factor).await?
                    }
                }
                info!(factor, target = ?target, "replication factor set");
                Ok(Vec::new())
            }
        }
    }

    async fn show_partition_keys(&self, database: Option<&str>) -> Result<Vec<Series>> {
        let mut keys = self.partition_keys.get_all().await?;
        keys.retain(|k| database.map(|db| k.database == db).unwrap_or(true));
        keys.sort_by_key(PartitionKey::id);
        let mut series = Series::new("", &["database", "measurement", "tags"]);
        for key in keys {
            series.values.push(vec![
                Value::from(key.database),
                Value::from(key.measurement),
                Value::from(key.tags),
            ]);
        }
        Ok(vec![series])
    }

    fn show_nodes(&self) -> Series {
        let mut members = self.nodes.get_all();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        let mut series = Series::new("", &["name", "location", "status", "tokens"]);
        for m in members {
            series.values.push(vec![
                Value::from(m.name),
                Value::from(m.location),
                Value::from(m.status.as_str()),
                Value::from(m.tokens.len()),
            ]);
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Keyspace, MemoryMetaStore, NodeStore, SharedMetaStore};
    use crate::{Member, NodeStatus};
    use serde_json::json;

    fn executor() -> (AdminExecutor, Arc<Partitioner>, Arc<SettingsStore>) {
        let meta: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let partitioner = Arc::new(Partitioner::new());
        let settings = Arc::new(SettingsStore::new(meta.clone(), keys.clone()));
        let nodes = Arc::new(NodeCollection::new(NodeStore::new(meta.clone(), keys.clone())));
        let executor = AdminExecutor::new(
            PartitionKeyStore::new(meta, keys),
            partitioner.clone(),
            nodes,
            settings.clone(),
        );
        (executor, partitioner, settings)
    }

    async fn run(executor: &AdminExecutor, q: &str) -> Result<Vec<Series>> {
        let statement = parse_admin(q).expect("admin statement")?;
        executor.execute(&statement, None).await
    }

    #[tokio::test]
    async fn test_partition_key_round_trip() {
        let (executor, partitioner, _) = executor();
        run(&executor, "CREATE PARTITION KEY server_id ON test_db").await.unwrap();
        let shown = run(&executor, "SHOW PARTITION KEYS").await.unwrap();
        assert_eq!(
            shown[0].values,
            vec![vec![json!("test_db"), json!(""), json!(["server_id"])]]
        );
        assert!(partitioner.get_key_by_measurement("test_db", "cpu").is_some());

        let err = run(&executor, "CREATE PARTITION KEY server_id ON test_db").await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        run(&executor, "DROP PARTITION KEY ON test_db").await.unwrap();
        let shown = run(&executor, "SHOW PARTITION KEYS ON test_db").await.unwrap();
        assert!(shown[0].values.is_empty());
        assert!(partitioner.is_empty());
        assert!(run(&executor, "DROP PARTITION KEY ON test_db").await.is_err());
    }

    #[tokio::test]
    async fn test_replication_factor() {
        let (executor, _, settings) = executor();
        run(&executor, "SET REPLICATION FACTOR 3").await.unwrap();
        run(&executor, "SET REPLICATION FACTOR 2 ON db.cpu").await.unwrap();
        assert_eq!(settings.rf_default(), 3);
        assert_eq!(settings.rf("db", "cpu"), 2);
        assert_eq!(settings.rf("db", "mem"), 3);
    }

    #[tokio::test]
    async fn test_show_nodes_and_remove_without_rebalancer() {
        let (executor, _, _) = executor();
        executor
            .nodes
            .persist(&Member::new("n1", "n1:8086").with_status(NodeStatus::Up))
            .await
            .unwrap();
        let shown = run(&executor, "SHOW NODES").await.unwrap();
        assert_eq!(shown[0].values[0][0], json!("n1"));
        assert_eq!(shown[0].values[0][2], json!(NodeStatus::Up.as_str()));
        assert!(run(&executor, "REMOVE NODE n1").await.is_err());
    }

    #[tokio::test]
    async fn test_requires_admin() {
        let (executor, _, _) = executor();
        let executor = executor.with_auth_enabled(true);
        let statement = AdminStatement::ShowNodes;
        assert!(matches!(
            executor.execute(&statement, None).await,
            Err(RelayError::Unauthorized(_))
        ));
    }
}
