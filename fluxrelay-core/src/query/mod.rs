//! Query coordinator
//!
//! Classifies every statement of a request and picks a strategy for it:
//! - cluster-wide writes fan out to every member
//! - schema reads go to the first member that answers
//! - measurement and series listings are unioned across members
//! - SELECTs go to the replica owning the partition when the WHERE clause
//!   pins every partition tag, else to one member per data location with
//!   the partial results merged
//! - user and grant statements run against the local auth service

pub mod merge;

pub use merge::{base_name, MergePlan};

use crate::auth::{AuthService, User};
use crate::influxql::{parse_query, BinaryOp, Expr, SelectStatement, Statement};
use crate::meta::SettingsStore;
use crate::partition::{fulfills_key, get_hash, Partitioner, TagValues};
use crate::resolver::{Purpose, Resolver};
use crate::tsdb::{QueryResponse, Series, SharedConnector, StatementResult};
use crate::{Member, NodeStatus, RelayError, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Routing class of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    /// Database, retention policy, series and measurement changes
    ClusterFanoutWrite,
    /// Schema reads every member answers alike
    FirstAvailableRead,
    /// Listings whose rows are spread over members
    ClusterUnionRead,
    PartitionedSelect,
    Auth,
    /// Shard-level diagnostics and SELECT INTO
    Refuse,
}

pub fn classify(statement: &Statement) -> StatementClass {
    use Statement::*;
    match statement {
        Select(select) if select.into.is_some() => StatementClass::Refuse,
        Select(_) => StatementClass::PartitionedSelect,
        ShowDatabases
        | ShowRetentionPolicies { .. }
        | ShowFieldKeys { .. }
        | ShowTagKeys { .. }
        | ShowContinuousQueries => StatementClass::FirstAvailableRead,
        ShowMeasurements { .. } | ShowSeries { .. } | ShowTagValues { .. } => {
            StatementClass::ClusterUnionRead
        }
        ShowUsers | ShowGrants { .. } | CreateUser { .. } | DropUser { .. } | SetPassword { .. }
        | Grant { .. } | Revoke { .. } => StatementClass::Auth,
        Diagnostic(_) => StatementClass::Refuse,
        CreateDatabase { .. }
        | DropDatabase { .. }
        | CreateRetentionPolicy(_)
        | AlterRetentionPolicy(_)
        | DropRetentionPolicy { .. }
        | CreateContinuousQuery { .. }
        | DropContinuousQuery { .. }
        | DropSeries { .. }
        | Delete { .. }
        | DropMeasurement { .. } => StatementClass::ClusterFanoutWrite,
    }
}

/// Tag values pinned by `tag = 'value'` comparisons ANDed at the top level
pub fn equality_bindings(condition: &Expr) -> TagValues {
    let mut values = TagValues::new();
    collect_equalities(condition, &mut values);
    for v in values.values_mut() {
        v.sort();
        v.dedup();
    }
    values
}

fn collect_equalities(expr: &Expr, values: &mut TagValues) {
    match expr.unparen() {
        Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => {
            collect_equalities(lhs, values);
            collect_equalities(rhs, values);
        }
        Expr::Binary {
            op: BinaryOp::Eq,
            lhs,
            rhs,
        } => match (lhs.unparen(), rhs.unparen()) {
            (Expr::VarRef(tag), Expr::String(value)) | (Expr::String(value), Expr::VarRef(tag)) => {
                values.entry(tag.clone()).or_default().push(value.clone());
            }
            _ => {}
        },
        _ => {}
    }
}

/// A `/query` request
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub database: String,
    pub query: String,
    /// Timestamp precision of the response, RFC3339 when absent
    pub epoch: Option<String>,
    /// Authenticated caller
    pub user: Option<User>,
}

/// Runs queries against the cluster
pub struct QueryCoordinator {
    partitioner: Arc<Partitioner>,
    resolver: Arc<Resolver>,
    settings: Arc<SettingsStore>,
    connector: SharedConnector,
    auth: Arc<AuthService>,
    auth_enabled: bool,
}

impl QueryCoordinator {
    pub fn new(
        partitioner: Arc<Partitioner>,
        resolver: Arc<Resolver>,
        settings: Arc<SettingsStore>,
        connector: SharedConnector,
        auth: Arc<AuthService>,
    ) -> Self {
        Self {
            partitioner,
            resolver,
            settings,
            connector,
            auth,
            auth_enabled: false,
        }
    }

    /// Check credentials and privileges for every statement
    pub fn with_auth_enabled(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let statements = parse_query(&request.query)?;
        if self.auth_enabled {
            for statement in &statements {
                self.auth
                    .check(request.user.as_ref(), statement, &request.database)?;
            }
        }
        let mut results = Vec::with_capacity(statements.len());
        for (id, statement) in statements.iter().enumerate() {
            let series = self
                .execute(statement, &request.database, request.epoch.as_deref())
                .await?;
            results.push(StatementResult::ok(id, series));
        }
        Ok(QueryResponse::from_results(results))
    }

    /// Run one statement
    pub async fn execute(&self, statement: &Statement, database: &str, epoch: Option<&str>) -> Result<Vec<Series>> {
        let class = classify(statement);
        debug!(?class, statement = %statement, "routing statement");
        match class {
            StatementClass::ClusterFanoutWrite => self.fanout(statement, database).await,
            StatementClass::FirstAvailableRead => self.first_available(statement, database, epoch).await,
            StatementClass::ClusterUnionRead => self.union_read(statement, database, epoch).await,
            StatementClass::PartitionedSelect => match statement {
                Statement::Select(select) => self.select(select, database, epoch).await,
                _ => Err(RelayError::Internal("select class without select".into())),
            },
            StatementClass::Auth => self.auth.execute(statement).await,
            StatementClass::Refuse => Err(RelayError::Unsupported(format!(
                "statement is not supported on cluster: {}",
                statement
            ))),
        }
    }

    async fn send(&self, member: &Member, database: &str, query: &str, epoch: Option<&str>) -> Result<Vec<Series>> {
        self.connector
            .connect(&member.location)
            .query(database, query, epoch)
            .await?
            .into_series()
    }

    /// Every member that should see cluster-wide changes, one per location
    fn fanout_members(&self) -> Vec<Member> {
        let mut locations = HashSet::new();
        self.resolver
            .nodes()
            .get_all()
            .into_iter()
            .filter(|m| m.status != NodeStatus::Removed)
            .filter(|m| locations.insert(m.location.clone()))
            .collect()
    }

    fn readable(&self) -> Result<Vec<Member>> {
        let members = self.resolver.find_all();
        if members.is_empty() {
            return Err(RelayError::NoHealthyReplica("no readable member".into()));
        }
        Ok(members)
    }

    async fn fanout(&self, statement: &Statement, database: &str) -> Result<Vec<Series>> {
        let query = statement.to_string();
        let members = self.fanout_members();
        if members.is_empty() {
            return Err(RelayError::NoHealthyReplica("no member to apply the statement".into()));
        }
        let results = join_all(members.iter().map(|m| self.send(m, database, &query, None))).await;
        let mut first = None;
        for result in results {
            let series = result?;
            first.get_or_insert(series);
        }
        Ok(first.unwrap_or_default())
    }

    async fn first_available(&self, statement: &Statement, database: &str, epoch: Option<&str>) -> Result<Vec<Series>> {
        let query = statement.to_string();
        let mut last_error = None;
        for member in self.readable()? {
            match self.send(&member, database, &query, epoch).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_retryable() => {
                    warn!(node = %member.name, error = %e, "member failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| RelayError::NoHealthyReplica("no readable member".into())))
    }

    async fn union_read(&self, statement: &Statement, database: &str, epoch: Option<&str>) -> Result<Vec<Series>> {
        let query = statement.to_string();
        let members = self.readable()?;
        let results = join_all(members.iter().map(|m| self.send(m, database, &query, epoch))).await;

        let mut merged: BTreeMap<(String, BTreeMap<String, String>), (Vec<String>, BTreeSet<String>, Vec<Series>)> =
            BTreeMap::new();
        for result in results {
            for series in result? {
                let entry = merged
                    .entry((series.name.clone(), series.tags.clone()))
                    .or_insert_with(|| (series.columns.clone(), BTreeSet::new(), Vec::new()));
                entry.2.push(series);
            }
        }

        let mut out = Vec::new();
        for ((name, tags), (columns, mut seen, parts)) in merged {
            let mut rows = Vec::new();
            for series in parts {
                for row in series.values {
                    if seen.insert(serde_json::to_string(&row)?) {
                        rows.push(row);
                    }
                }
            }
            rows.sort_by(|a, b| serde_json::to_string(a).ok().cmp(&serde_json::to_string(b).ok()));
            out.push(Series {
                name,
                tags,
                columns,
                values: rows,
            });
        }
        Ok(out)
    }

    /// Members a SELECT has to reach
    pub fn route_select(&self, select: &SelectStatement, database: &str) -> Result<Vec<Member>> {
        if let Some(member) = self.owning_replica(select, database)? {
            return Ok(vec![member]);
        }
        self.readable()
    }

    fn owning_replica(&self, select: &SelectStatement, database: &str) -> Result<Option<Member>> {
        let [source] = select.sources.as_slice() else {
            return Ok(None);
        };
        if source.regex.is_some() {
            return Ok(None);
        }
        let database = source.database.as_deref().unwrap_or(database);
        let Some(key) = self.partitioner.get_key_by_measurement(database, &source.name) else {
            return Ok(None);
        };
        let Some(condition) = &select.condition else {
            return Ok(None);
        };
        let values = equality_bindings(condition);
        let pinned = key
            .tags
            .iter()
            .all(|t| values.get(t).map(|v| v.len() == 1).unwrap_or(false));
        if !pinned || !fulfills_key(&key, &values) {
            return Ok(None);
        }
        let hash = get_hash(&key, &values)?;
        let rf = self.settings.rf(database, &source.name);
        let replicas = self.resolver.find_nodes_by_key_n(hash, rf, Purpose::Read);
        match replicas.into_iter().next() {
            Some(member) => Ok(Some(member)),
            None => Err(RelayError::NoHealthyReplica(format!(
                "no readable replica for {}.{}",
                database, source.name
            ))),
        }
    }

    async fn select(&self, select: &SelectStatement, database: &str, epoch: Option<&str>) -> Result<Vec<Series>> {
        let members = self.route_select(select, database)?;
        if let [member] = members.as_slice() {
            debug!(node = %member.name, "select served by a single member");
            return self.send(member, database, &select.to_string(), epoch).await;
        }

        let plan = MergePlan::new(select)?;
        let query = plan.rewritten().to_string();
        debug!(members = members.len(), rewritten = %query, "merging select");
        let results = join_all(members.iter().map(|m| self.send(m, database, &query, Some("ns")))).await;
        let responses = results.into_iter().collect::<Result<Vec<_>>>()?;
        plan.merge(responses, epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influxql::parse_statement;
    use crate::meta::{Keyspace, MemoryMetaStore, NodeStore, SharedMetaStore};
    use crate::nodes::NodeCollection;
    use crate::partition::PartitionKey;
    use crate::tsdb::{MemoryCluster, Tsdb, WriteRequest};
    use serde_json::json;

    struct Fixture {
        coordinator: QueryCoordinator,
        cluster: Arc<MemoryCluster>,
    }

    async fn fixture() -> Fixture {
        let meta: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let keys = Keyspace::new("/fluxrelay", "t");
        let nodes = Arc::new(NodeCollection::new(NodeStore::new(meta.clone(), keys.clone())));
        for name in ["n1", "n2"] {
            nodes
                .persist(&Member::new(name, format!("{}:8086", name)).with_status(NodeStatus::Up))
                .await
                .unwrap();
        }
        let resolver = Arc::new(Resolver::new(nodes, 1));
        resolver.add_token(0, "n1");
        resolver.add_token(3_000_000_000, "n2");
        let partitioner = Arc::new(Partitioner::new());
        partitioner.add_key(PartitionKey::new("sharded", "treasures", vec!["type".into()]));

        let cluster = Arc::new(MemoryCluster::new());
        let n1 = cluster.get("n1:8086");
        let n2 = cluster.get("n2:8086");
        for tsdb in [&n1, &n2] {
            tsdb.query("", "CREATE DATABASE sharded", None).await.unwrap();
        }
        // trash hashes into n2's range, gold and silver into n1's
        n2.write(&WriteRequest::new("sharded", "treasures,type=trash value=0 1"))
            .await
            .unwrap();
        n1.write(&WriteRequest::new(
            "sharded",
            "treasures,type=gold value=100 2\ntreasures,type=silver value=50 3",
        ))
        .await
        .unwrap();

        let settings = Arc::new(SettingsStore::new(meta.clone(), keys.clone()));
        let auth = Arc::new(AuthService::new(meta, keys));
        Fixture {
            coordinator: QueryCoordinator::new(partitioner, resolver, settings, cluster.clone(), auth),
            cluster,
        }
    }

    fn request(q: &str) -> QueryRequest {
        QueryRequest {
            database: "sharded".into(),
            query: q.into(),
            epoch: Some("ns".into()),
            user: None,
        }
    }

    #[test]
    fn test_classify() {
        let class = |q: &str| classify(&parse_statement(q).unwrap());
        assert_eq!(class("SELECT * FROM cpu"), StatementClass::PartitionedSelect);
        assert_eq!(class("SHOW DATABASES"), StatementClass::FirstAvailableRead);
        assert_eq!(class("SHOW MEASUREMENTS"), StatementClass::ClusterUnionRead);
        assert_eq!(class("CREATE DATABASE db"), StatementClass::ClusterFanoutWrite);
        assert_eq!(class("DROP SERIES FROM cpu WHERE host = 'a'"), StatementClass::ClusterFanoutWrite);
        assert_eq!(class("SHOW USERS"), StatementClass::Auth);
        assert_eq!(class("SHOW SHARDS"), StatementClass::Refuse);
    }

    #[test]
    fn test_equality_bindings() {
        let cond = crate::influxql::parse_expr("type = 'gold' AND ('x' = host) AND value > 1").unwrap();
        let values = equality_bindings(&cond);
        assert_eq!(values["type"], vec!["gold"]);
        assert_eq!(values["host"], vec!["x"]);
        let or = crate::influxql::parse_expr("type = 'gold' OR type = 'trash'").unwrap();
        assert!(equality_bindings(&or).is_empty());
    }

    #[tokio::test]
    async fn test_merged_mean_over_members() {
        let f = fixture().await;
        let response = f
            .coordinator
            .query(&request(
                "SELECT mean(value) FROM treasures WHERE type='gold' OR type='trash' OR type='silver' GROUP BY time(1d)",
            ))
            .await
            .unwrap();
        let series = response.into_series().unwrap();
        assert_eq!(series[0].columns, vec!["time", "mean"]);
        assert_eq!(series[0].values, vec![vec![json!(0), json!(50.0)]]);
    }

    #[tokio::test]
    async fn test_pinned_select_hits_one_member() {
        let f = fixture().await;
        let before = f.cluster.get("n2:8086").query_count();
        let series = f
            .coordinator
            .query(&request("SELECT mean(value) FROM treasures WHERE type='gold'"))
            .await
            .unwrap()
            .into_series()
            .unwrap();
        assert_eq!(series[0].values[0][1], json!(100.0));
        assert_eq!(f.cluster.get("n2:8086").query_count(), before);
    }

    #[tokio::test]
    async fn test_fanout_and_union() {
        let f = fixture().await;
        f.coordinator
            .query(&request("CREATE DATABASE other"))
            .await
            .unwrap();
        for location in ["n1:8086", "n2:8086"] {
            let dbs = crate::tsdb::query_series(f.cluster.get(location).as_ref(), "", "SHOW DATABASES")
                .await
                .unwrap();
            assert!(dbs[0].strings("name").contains(&"other".to_string()));
        }

        let series = f
            .coordinator
            .query(&request("SHOW SERIES"))
            .await
            .unwrap()
            .into_series()
            .unwrap();
        assert_eq!(series[0].values.len(), 3);
    }

    #[tokio::test]
    async fn test_refused_and_auth_statements() {
        let f = fixture().await;
        let err = f.coordinator.query(&request("SHOW SHARDS")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        f.coordinator
            .query(&request("CREATE USER bob WITH PASSWORD 'pw'"))
            .await
            .unwrap();
        let users = f
            .coordinator
            .query(&request("SHOW USERS"))
            .await
            .unwrap()
            .into_series()
            .unwrap();
        assert_eq!(users[0].values, vec![vec![json!("bob"), json!(false)]]);
    }

    #[tokio::test]
    async fn test_auth_enforced() {
        let mut f = fixture().await;
        f.coordinator = f.coordinator.with_auth_enabled(true);
        let err = f.coordinator.query(&request("SELECT * FROM treasures")).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
    }
}
