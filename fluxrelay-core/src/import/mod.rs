//! Importer
//!
//! Pulls series from the members currently holding a token range into a
//! target member's TSDB. Sources are read in time-ordered `LIMIT`/`OFFSET`
//! pages per series and rewritten as line protocol, so re-running an
//! import over the same range only rewrites identical points.

mod meta;
mod reliable;

pub use meta::{fetch as fetch_meta, DatabaseInfo, MeasurementInfo, RetentionPolicyInfo, SourceMeta};
pub use reliable::{DeleteTask, DeleteWorker, ImportHook, ImportTask, ReassignHook, ReliableImporter};

use crate::config::{IMPORT_PAGE_SIZE, IMPORT_WRITE_BATCH};
use crate::hash::database_token;
use crate::influxql::{BinaryOp, Dimension, Expr, Field, Measurement, RetentionPolicyDef, SelectStatement, Statement};
use crate::partition::{get_hash, PartitionKey, Partitioner};
use crate::resolver::{Purpose, Resolver};
use crate::tsdb::line_protocol::render_point;
use crate::tsdb::{parse_time, query_series, SharedConnector, Tsdb, WriteRequest};
use crate::{FieldValue, Fields, Member, NodeStatus, Point, Result, SeriesKey, Token};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with one measurement during an import
#[derive(Debug, Clone, PartialEq)]
pub enum ImportDecision {
    NoImport,
    /// Copy only the series hashing into the requested tokens
    PartitionImport(PartitionKey),
    /// Copy the whole measurement
    FullImport,
}

/// Counters reported by an import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub series: usize,
    pub points: usize,
}

impl AddAssign for ImportStats {
    fn add_assign(&mut self, other: Self) {
        self.series += other.series;
        self.points += other.points;
    }
}

/// Copies data between member TSDBs
pub struct Importer {
    resolver: Arc<Resolver>,
    partitioner: Arc<Partitioner>,
    connector: SharedConnector,
    cache: Mutex<HashMap<String, Arc<SourceMeta>>>,
    page_size: usize,
    write_batch: usize,
}

impl Importer {
    pub fn new(resolver: Arc<Resolver>, partitioner: Arc<Partitioner>, connector: SharedConnector) -> Self {
        Self {
            resolver,
            partitioner,
            connector,
            cache: Mutex::new(HashMap::new()),
            page_size: IMPORT_PAGE_SIZE,
            write_batch: IMPORT_WRITE_BATCH,
        }
    }

    /// Override page and write batch sizes
    pub fn with_batching(mut self, page_size: usize, write_batch: usize) -> Self {
        self.page_size = page_size.max(1);
        self.write_batch = write_batch.max(1);
        self
    }

    /// Forget cached source schemas
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    async fn source_meta(&self, source: &dyn Tsdb) -> Result<Arc<SourceMeta>> {
        if let Some(meta) = self.cache.lock().get(source.location()) {
            return Ok(meta.clone());
        }
        let meta = Arc::new(fetch_meta(source).await?);
        self.cache
            .lock()
            .insert(source.location().to_string(), meta.clone());
        Ok(meta)
    }

    fn token_of(&self, hash: Token) -> Option<Token> {
        self.resolver.ring().get(hash).map(|p| p.token)
    }

    /// Whether `member` is among the first `rf` write replicas of `key`
    fn hosts(&self, member: &Member, key: Token, rf: usize) -> bool {
        self.resolver
            .find_nodes_by_key_n(key, rf, Purpose::Write)
            .iter()
            .any(|m| m.name == member.name)
    }

    /// How `(database, measurement)` is imported into `target`
    pub fn decide(&self, target: &Member, database: &str, measurement: &str) -> ImportDecision {
        match self.partitioner.get_key_by_measurement(database, measurement) {
            Some(key) => ImportDecision::PartitionImport(key),
            None if self.hosts(
                target,
                database_token(database),
                self.resolver.replication_factor_for(database, measurement),
            ) =>
            {
                ImportDecision::FullImport
            }
            None => ImportDecision::NoImport,
        }
    }

    /// Copy every unpartitioned measurement whose database resolves to `target`
    pub async fn import_non_partitioned(&self, target: &Member) -> Result<ImportStats> {
        let sink = self.connector.connect(&target.location);
        let mut locations = HashSet::new();
        let mut stats = ImportStats::default();
        for source in self.resolver.nodes().get_all() {
            if source.name == target.name
                || source.location == target.location
                || !source.is_readable()
                || !locations.insert(source.location.clone())
            {
                continue;
            }
            let tsdb = self.connector.connect(&source.location);
            let meta = self.source_meta(&*tsdb).await?;
            self.prepare_target(&*sink, &meta).await?;
            for db in &meta.databases {
                for measurement in &db.measurements {
                    if self.decide(target, &db.name, &measurement.name) != ImportDecision::FullImport {
                        continue;
                    }
                    for key in &measurement.series {
                        stats += self.copy_series(&*tsdb, &*sink, db, measurement, key).await?;
                    }
                }
            }
        }
        info!(node = %target.name, series = stats.series, points = stats.points, "unpartitioned import done");
        Ok(stats)
    }

    /// Copy the series of `tokens` from their current holders into `target`
    pub async fn import_partitioned(&self, tokens: &BTreeSet<Token>, target: &Member) -> Result<ImportStats> {
        let mut stats = ImportStats::default();
        for token in tokens {
            stats += self.import_token(*token, target).await?;
        }
        Ok(stats)
    }

    /// Copy one token's series into `target`
    ///
    /// Unpartitioned databases whose hash lands on `token` are copied whole.
    pub async fn import_token(&self, token: Token, target: &Member) -> Result<ImportStats> {
        let sink = self.connector.connect(&target.location);
        let mut stats = ImportStats::default();
        for source in self.resolver.find_nodes_by_key(token, Purpose::Write) {
            if source.name == target.name || source.location == target.location {
                continue;
            }
            let tsdb = self.connector.connect(&source.location);
            let meta = match self.source_meta(&*tsdb).await {
                Ok(meta) => meta,
                Err(e) if source.status == NodeStatus::Removed => {
                    warn!(node = %source.name, token, error = %e, "removed source unreachable, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.prepare_target(&*sink, &meta).await?;

            for db in &meta.databases {
                let whole_db = self.token_of(database_token(&db.name)) == Some(token);
                for measurement in &db.measurements {
                    let key = self.partitioner.get_key_by_measurement(&db.name, &measurement.name);
                    for series in &measurement.series {
                        let wanted = match &key {
                            Some(key) => match get_hash(key, &series.tag_values()) {
                                Ok(hash) => self.token_of(hash) == Some(token),
                                Err(_) => false,
                            },
                            None => whole_db,
                        };
                        if wanted {
                            stats += self.copy_series(&*tsdb, &*sink, db, measurement, series).await?;
                        }
                    }
                }
            }
        }
        debug!(token, node = %target.name, series = stats.series, points = stats.points, "token imported");
        Ok(stats)
    }

    /// Drop the series of `token` that `member` no longer hosts
    ///
    /// Unpartitioned measurements go as a whole once their database hash
    /// lands on `token` and resolves elsewhere.
    pub async fn delete_by_token(&self, member: &Member, token: Token) -> Result<usize> {
        let tsdb = self.connector.connect(&member.location);
        let meta = fetch_meta(&*tsdb).await?;
        let mut dropped = 0;
        for db in &meta.databases {
            let db_token = database_token(&db.name);
            for measurement in &db.measurements {
                let rf = self.resolver.replication_factor_for(&db.name, &measurement.name);
                match self.partitioner.get_key_by_measurement(&db.name, &measurement.name) {
                    Some(key) => {
                        for series in &measurement.series {
                            let Ok(hash) = get_hash(&key, &series.tag_values()) else {
                                continue;
                            };
                            if self.token_of(hash) != Some(token) || self.hosts(member, hash, rf) {
                                continue;
                            }
                            let stmt = Statement::DropSeries {
                                from: Some(Measurement::named(series.measurement.clone())),
                                condition: tag_predicate(series),
                            };
                            query_series(&*tsdb, &db.name, &stmt.to_string()).await?;
                            dropped += 1;
                        }
                    }
                    None => {
                        if self.token_of(db_token) != Some(token) || self.hosts(member, db_token, rf) {
                            continue;
                        }
                        let stmt = Statement::DropMeasurement {
                            name: measurement.name.clone(),
                        };
                        query_series(&*tsdb, &db.name, &stmt.to_string()).await?;
                        dropped += 1;
                    }
                }
            }
        }
        if dropped > 0 {
            info!(node = %member.name, token, dropped, "deleted displaced data");
        }
        Ok(dropped)
    }

    /// Create databases, retention policies and continuous queries of a source on the sink
    async fn prepare_target(&self, sink: &dyn Tsdb, meta: &SourceMeta) -> Result<()> {
        for db in &meta.databases {
            let create = Statement::CreateDatabase { name: db.name.clone() };
            query_series(sink, "", &create.to_string()).await?;
            for rp in &db.retention_policies {
                let stmt = Statement::CreateRetentionPolicy(RetentionPolicyDef {
                    name: rp.name.clone(),
                    database: db.name.clone(),
                    duration: Some(rp.duration),
                    replication: Some(rp.replication),
                    shard_duration: Some(rp.shard_duration),
                    default: rp.default,
                });
                if let Err(e) = query_series(sink, &db.name, &stmt.to_string()).await {
                    warn!(db = %db.name, rp = %rp.name, error = %e, "could not create retention policy");
                }
            }
            for (name, query) in &db.continuous_queries {
                if let Err(e) = query_series(sink, &db.name, query).await {
                    warn!(db = %db.name, cq = %name, error = %e, "could not create continuous query");
                }
            }
        }
        Ok(())
    }

    async fn copy_series(
        &self,
        source: &dyn Tsdb,
        sink: &dyn Tsdb,
        db: &DatabaseInfo,
        measurement: &MeasurementInfo,
        key: &SeriesKey,
    ) -> Result<ImportStats> {
        let mut stats = ImportStats {
            series: 1,
            points: 0,
        };
        let rps: Vec<&str> = if db.retention_policies.is_empty() {
            vec![""]
        } else {
            db.retention_policies.iter().map(|rp| rp.name.as_str()).collect()
        };
        for rp in rps {
            stats.points += self.copy_series_rp(source, sink, &db.name, rp, measurement, key).await?;
        }
        Ok(stats)
    }

    async fn copy_series_rp(
        &self,
        source: &dyn Tsdb,
        sink: &dyn Tsdb,
        db: &str,
        rp: &str,
        measurement: &MeasurementInfo,
        key: &SeriesKey,
    ) -> Result<usize> {
        let mut select = SelectStatement {
            fields: vec![Field::new(Expr::Wildcard)],
            sources: vec![Measurement {
                database: Some(db.to_string()),
                retention_policy: (!rp.is_empty()).then(|| rp.to_string()),
                name: key.measurement.clone(),
                regex: None,
            }],
            condition: tag_predicate(key),
            dimensions: vec![Dimension::Wildcard],
            limit: Some(self.page_size as u64),
            ..Default::default()
        };

        let mut offset = 0;
        let mut copied = 0;
        let mut batch = Vec::new();
        loop {
            select.offset = (offset > 0).then_some(offset as u64);
            let page = query_series(source, db, &select.to_string())
                .await?
                .into_iter()
                .find(|s| s.name == key.measurement && same_tags(&s.tags, &key.tags));
            let Some(page) = page else {
                break;
            };
            let rows = page.values.len();
            for row in &page.values {
                let Some(point) = row_to_point(key, &page.columns, row, &measurement.field_types) else {
                    continue;
                };
                batch.push(render_point(&point));
                copied += 1;
                if batch.len() >= self.write_batch {
                    flush(sink, db, rp, &mut batch).await?;
                }
            }
            offset += rows;
            if rows < self.page_size {
                break;
            }
        }
        flush(sink, db, rp, &mut batch).await?;
        Ok(copied)
    }
}

async fn flush(sink: &dyn Tsdb, db: &str, rp: &str, batch: &mut Vec<String>) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut body = batch.join("\n");
    body.push('\n');
    batch.clear();
    sink.write(&WriteRequest::new(db, body).with_retention_policy(rp))
        .await
}

/// `k1 = 'v1' AND k2 = 'v2'` over every tag of a series
pub fn tag_predicate(key: &SeriesKey) -> Option<Expr> {
    key.tags
        .iter()
        .map(|(k, v)| Expr::binary(BinaryOp::Eq, Expr::var(k.clone()), Expr::String(v.clone())))
        .reduce(|acc, e| Expr::binary(BinaryOp::And, acc, e))
}

/// Group tags equal series tags; absent tags come back as empty strings
fn same_tags(group: &BTreeMap<String, String>, series: &BTreeMap<String, String>) -> bool {
    group.iter().filter(|(_, v)| !v.is_empty()).eq(series.iter())
}

fn field_value(value: &Value, field_type: Option<&str>) -> Option<FieldValue> {
    match (field_type, value) {
        (_, Value::Null) => None,
        (Some("integer"), v) => v
            .as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .map(FieldValue::Integer),
        (Some("float"), v) => v.as_f64().map(FieldValue::Float),
        (_, Value::Bool(b)) => Some(FieldValue::Boolean(*b)),
        (_, Value::String(s)) => Some(FieldValue::String(s.clone())),
        (_, Value::Number(n)) => n
            .as_i64()
            .map(FieldValue::Integer)
            .or_else(|| n.as_f64().map(FieldValue::Float)),
        _ => None,
    }
}

fn row_to_point(
    key: &SeriesKey,
    columns: &[String],
    row: &[Value],
    field_types: &BTreeMap<String, String>,
) -> Option<Point> {
    let timestamp = parse_time(row.first()?)?;
    let mut fields = Fields::new();
    for (column, value) in columns.iter().zip(row).skip(1) {
        if key.tags.contains_key(column) {
            continue;
        }
        if let Some(v) = field_value(value, field_types.get(column).map(String::as_str)) {
            fields.insert(column.clone(), v);
        }
    }
    (!fields.is_empty()).then(|| Point::new(key.clone(), fields, timestamp))
}
