//! In-memory TSDB
//!
//! Answers the statement subset the cluster issues against its members,
//! enough to run multi-node clusters inside one process. Points are keyed by
//! series and timestamp, so rewriting the same point is idempotent.
//! Retention policies are tracked as metadata only; all data of a database
//! lives in one store.

use super::aggregates::new_accumulator;
use super::eval::{self, RowRef};
use super::line_protocol::{parse_points, render_series_key};
use super::{
    apply_fill, format_go_duration, format_time, QueryResponse, Series, SharedTsdb,
    StatementResult, Tsdb, TsdbConnector, WriteRequest,
};
use crate::influxql::{
    parse_query, Dimension, Expr, Fill, Measurement, RetentionPolicyDef, SelectStatement,
    Statement,
};
use crate::{FieldValue, Fields, Point, RelayError, Result, SeriesKey, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Version reported by `ping`
pub const MEMORY_TSDB_VERSION: &str = "1.8.10-memory";

/// Buckets beyond this are not materialised for fill
const MAX_FILL_BUCKETS: i64 = 100_000;

#[derive(Debug, Clone, PartialEq)]
struct RetentionPolicy {
    duration: i64,
    shard_duration: i64,
    replication: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            duration: 0,
            shard_duration: 7 * 86_400_000_000_000,
            replication: 1,
        }
    }
}

#[derive(Debug)]
struct Database {
    retention_policies: BTreeMap<String, RetentionPolicy>,
    default_rp: String,
    continuous_queries: BTreeMap<String, String>,
    series: BTreeMap<SeriesKey, BTreeMap<Timestamp, Fields>>,
}

impl Default for Database {
    fn default() -> Self {
        let mut retention_policies = BTreeMap::new();
        retention_policies.insert("autogen".to_string(), RetentionPolicy::default());
        Self {
            retention_policies,
            default_rp: "autogen".into(),
            continuous_queries: BTreeMap::new(),
            series: BTreeMap::new(),
        }
    }
}

impl Database {
    fn measurements(&self) -> BTreeSet<String> {
        self.series.keys().map(|k| k.measurement.clone()).collect()
    }

    /// Measurement names selected by a FROM clause (all when absent)
    fn resolve(&self, from: Option<&Measurement>) -> Result<BTreeSet<String>> {
        let all = self.measurements();
        let Some(m) = from else {
            return Ok(all);
        };
        match &m.regex {
            Some(pattern) => {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| RelayError::BadRequest(format!("invalid regex: {}", e)))?;
                Ok(all.into_iter().filter(|n| re.is_match(n)).collect())
            }
            None => Ok([m.name.clone()].into_iter().collect()),
        }
    }

    /// Series of the selected measurements whose tags satisfy `condition`
    fn matching_series<'a>(
        &'a self,
        measurements: &'a BTreeSet<String>,
        condition: Option<&'a Expr>,
        now: Timestamp,
    ) -> impl Iterator<Item = &'a SeriesKey> + 'a {
        let empty = Fields::new();
        self.series.keys().filter(move |key| {
            measurements.contains(&key.measurement)
                && condition
                    .map(|c| eval::truthy(c, &RowRef { key, time: 0, fields: &empty }, now))
                    .unwrap_or(true)
        })
    }
}

/// An in-memory TSDB instance
pub struct MemoryTsdb {
    location: String,
    online: AtomicBool,
    queries: AtomicU64,
    writes: AtomicU64,
    databases: RwLock<BTreeMap<String, Database>>,
}

impl MemoryTsdb {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            online: AtomicBool::new(true),
            queries: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            databases: RwLock::new(BTreeMap::new()),
        }
    }

    /// Simulate the process going away or coming back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of `/query` calls served
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `/write` calls served
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every stored point of a database
    pub fn points(&self, database: &str) -> Vec<Point> {
        let dbs = self.databases.read();
        let Some(db) = dbs.get(database) else {
            return Vec::new();
        };
        db.series
            .iter()
            .flat_map(|(key, points)| {
                points
                    .iter()
                    .map(move |(ts, fields)| Point::new(key.clone(), fields.clone(), *ts))
            })
            .collect()
    }

    fn unavailable(&self) -> RelayError {
        RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("{}: connection refused", self.location),
        ))
    }

    fn insert(&self, request: &WriteRequest) -> Result<()> {
        let body = std::str::from_utf8(&request.body)
            .map_err(|_| RelayError::Tsdb { status: 400, message: "body is not UTF-8".into() })?;
        let points = parse_points(body, &request.precision, now_nanos()).map_err(|e| {
            RelayError::Tsdb { status: 400, message: e.to_string() }
        })?;
        let mut dbs = self.databases.write();
        let db = dbs.get_mut(&request.database).ok_or_else(|| RelayError::Tsdb {
            status: 404,
            message: format!("database not found: \"{}\"", request.database),
        })?;
        if !request.retention_policy.is_empty()
            && !db.retention_policies.contains_key(&request.retention_policy)
        {
            return Err(RelayError::Tsdb {
                status: 404,
                message: format!("retention policy not found: {}", request.retention_policy),
            });
        }
        for point in points {
            let stored = db
                .series
                .entry(point.key)
                .or_default()
                .entry(point.timestamp)
                .or_default();
            for (k, v) in point.fields.iter() {
                stored.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        stmt: &Statement,
        database: &str,
        epoch: Option<&str>,
        now: Timestamp,
    ) -> Result<Vec<Series>> {
        let db_name = |on: &Option<String>| -> Result<String> {
            match on {
                Some(db) => Ok(db.clone()),
                None if !database.is_empty() => Ok(database.to_string()),
                None => Err(RelayError::BadRequest("database name required".into())),
            }
        };
        let not_found = |name: &str| RelayError::NotFound(format!("database not found: {}", name));

        match stmt {
            Statement::ShowDatabases => {
                let mut series = Series::new("databases", &["name"]);
                for name in self.databases.read().keys() {
                    series.values.push(vec![Value::from(name.as_str())]);
                }
                Ok(vec![series])
            }
            Statement::CreateDatabase { name } => {
                self.databases.write().entry(name.clone()).or_default();
                Ok(Vec::new())
            }
            Statement::DropDatabase { name } => {
                self.databases.write().remove(name);
                Ok(Vec::new())
            }
            Statement::Select(select) => {
                let name = match select.sources.first().and_then(|s| s.database.clone()) {
                    Some(db) => db,
                    None => db_name(&None)?,
                };
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                run_select(db, select, epoch, now)
            }
            Statement::ShowMeasurements { on, condition } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let all = db.measurements();
                let names: BTreeSet<&str> = db
                    .matching_series(&all, condition.as_ref(), now)
                    .map(|k| k.measurement.as_str())
                    .collect();
                if names.is_empty() {
                    return Ok(Vec::new());
                }
                let mut series = Series::new("measurements", &["name"]);
                series.values = names.into_iter().map(|n| vec![Value::from(n)]).collect();
                Ok(vec![series])
            }
            Statement::ShowSeries { on, from, condition } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                let keys: Vec<String> = db
                    .matching_series(&measurements, condition.as_ref(), now)
                    .map(render_series_key)
                    .collect();
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                let mut series = Series::new("", &["key"]);
                series.values = keys.into_iter().map(|k| vec![Value::from(k)]).collect();
                Ok(vec![series])
            }
            Statement::ShowTagKeys { on, from } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                let mut by_measurement: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
                for key in db.matching_series(&measurements, None, now) {
                    let keys = by_measurement.entry(key.measurement.as_str()).or_default();
                    keys.extend(key.tags.keys().map(String::as_str));
                }
                Ok(by_measurement
                    .into_iter()
                    .filter(|(_, keys)| !keys.is_empty())
                    .map(|(m, keys)| {
                        let mut series = Series::new(m, &["tagKey"]);
                        series.values = keys.into_iter().map(|k| vec![Value::from(k)]).collect();
                        series
                    })
                    .collect())
            }
            Statement::ShowTagValues { on, from, keys, condition } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                let mut by_measurement: BTreeMap<&str, BTreeSet<(&str, &str)>> = BTreeMap::new();
                for key in db.matching_series(&measurements, condition.as_ref(), now) {
                    let pairs = by_measurement.entry(key.measurement.as_str()).or_default();
                    for (k, v) in &key.tags {
                        if keys.contains(k) {
                            pairs.insert((k.as_str(), v.as_str()));
                        }
                    }
                }
                Ok(by_measurement
                    .into_iter()
                    .filter(|(_, pairs)| !pairs.is_empty())
                    .map(|(m, pairs)| {
                        let mut series = Series::new(m, &["key", "value"]);
                        series.values = pairs
                            .into_iter()
                            .map(|(k, v)| vec![Value::from(k), Value::from(v)])
                            .collect();
                        series
                    })
                    .collect())
            }
            Statement::ShowFieldKeys { on, from } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                let mut by_measurement: BTreeMap<&str, BTreeMap<&str, &'static str>> =
                    BTreeMap::new();
                for (key, points) in &db.series {
                    if !measurements.contains(&key.measurement) {
                        continue;
                    }
                    let types = by_measurement.entry(key.measurement.as_str()).or_default();
                    for fields in points.values() {
                        for (k, v) in fields.iter() {
                            types.entry(k.as_str()).or_insert(v.type_name());
                        }
                    }
                }
                Ok(by_measurement
                    .into_iter()
                    .map(|(m, types)| {
                        let mut series = Series::new(m, &["fieldKey", "fieldType"]);
                        series.values = types
                            .into_iter()
                            .map(|(k, t)| vec![Value::from(k), Value::from(t)])
                            .collect();
                        series
                    })
                    .collect())
            }
            Statement::ShowRetentionPolicies { on } => {
                let name = db_name(on)?;
                let dbs = self.databases.read();
                let db = dbs.get(&name).ok_or_else(|| not_found(&name))?;
                let mut series = Series::new(
                    "",
                    &["name", "duration", "shardGroupDuration", "replicaN", "default"],
                );
                for (rp_name, rp) in &db.retention_policies {
                    series.values.push(vec![
                        Value::from(rp_name.as_str()),
                        Value::from(format_go_duration(rp.duration)),
                        Value::from(format_go_duration(rp.shard_duration)),
                        Value::from(rp.replication),
                        Value::from(*rp_name == db.default_rp),
                    ]);
                }
                Ok(vec![series])
            }
            Statement::CreateRetentionPolicy(def) => self.create_rp(def),
            Statement::AlterRetentionPolicy(def) => {
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(&def.database).ok_or_else(|| not_found(&def.database))?;
                let rp = db.retention_policies.get_mut(&def.name).ok_or_else(|| {
                    RelayError::NotFound(format!("retention policy not found: {}", def.name))
                })?;
                if let Some(d) = def.duration {
                    rp.duration = d;
                }
                if let Some(r) = def.replication {
                    rp.replication = r;
                }
                if let Some(sd) = def.shard_duration {
                    rp.shard_duration = sd;
                }
                if def.default {
                    db.default_rp = def.name.clone();
                }
                Ok(Vec::new())
            }
            Statement::DropRetentionPolicy { name, database } => {
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(database).ok_or_else(|| not_found(database))?;
                db.retention_policies.remove(name);
                Ok(Vec::new())
            }
            Statement::ShowContinuousQueries => {
                let dbs = self.databases.read();
                Ok(dbs
                    .iter()
                    .map(|(name, db)| {
                        let mut series = Series::new(name.as_str(), &["name", "query"]);
                        series.values = db
                            .continuous_queries
                            .iter()
                            .map(|(cq, q)| vec![Value::from(cq.as_str()), Value::from(q.as_str())])
                            .collect();
                        series
                    })
                    .collect())
            }
            Statement::CreateContinuousQuery { name, database, .. } => {
                let text = stmt.to_string();
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(database).ok_or_else(|| not_found(database))?;
                match db.continuous_queries.get(name) {
                    Some(existing) if *existing != text => Err(RelayError::Conflict(
                        "continuous query already exists".into(),
                    )),
                    _ => {
                        db.continuous_queries.insert(name.clone(), text);
                        Ok(Vec::new())
                    }
                }
            }
            Statement::DropContinuousQuery { name, database } => {
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(database).ok_or_else(|| not_found(database))?;
                db.continuous_queries.remove(name);
                Ok(Vec::new())
            }
            Statement::DropSeries { from, condition } => {
                let name = db_name(&None)?;
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                let doomed: Vec<SeriesKey> = db
                    .matching_series(&measurements, condition.as_ref(), now)
                    .cloned()
                    .collect();
                for key in doomed {
                    db.series.remove(&key);
                }
                Ok(Vec::new())
            }
            Statement::Delete { from, condition } => {
                let name = db_name(&None)?;
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(&name).ok_or_else(|| not_found(&name))?;
                let measurements = db.resolve(from.as_ref())?;
                for (key, points) in db.series.iter_mut() {
                    if !measurements.contains(&key.measurement) {
                        continue;
                    }
                    points.retain(|ts, fields| match condition {
                        Some(c) => {
                            let row = RowRef { key, time: *ts, fields: &*fields };
                            !eval::truthy(c, &row, now)
                        }
                        None => false,
                    });
                }
                db.series.retain(|_, points| !points.is_empty());
                Ok(Vec::new())
            }
            Statement::DropMeasurement { name: measurement } => {
                let name = db_name(&None)?;
                let mut dbs = self.databases.write();
                let db = dbs.get_mut(&name).ok_or_else(|| not_found(&name))?;
                db.series.retain(|key, _| key.measurement != *measurement);
                Ok(Vec::new())
            }
            Statement::ShowUsers => Ok(vec![Series::new("", &["user", "admin"])]),
            Statement::ShowGrants { .. } => Ok(vec![Series::new("", &["database", "privilege"])]),
            Statement::CreateUser { .. }
            | Statement::DropUser { .. }
            | Statement::SetPassword { .. }
            | Statement::Grant { .. }
            | Statement::Revoke { .. }
            | Statement::Diagnostic(_) => Ok(Vec::new()),
        }
    }

    fn create_rp(&self, def: &RetentionPolicyDef) -> Result<Vec<Series>> {
        let mut dbs = self.databases.write();
        let db = dbs
            .get_mut(&def.database)
            .ok_or_else(|| RelayError::NotFound(format!("database not found: {}", def.database)))?;
        let defaults = RetentionPolicy::default();
        let rp = RetentionPolicy {
            duration: def.duration.unwrap_or(defaults.duration),
            shard_duration: def.shard_duration.unwrap_or(defaults.shard_duration),
            replication: def.replication.unwrap_or(defaults.replication),
        };
        match db.retention_policies.get(&def.name) {
            Some(existing) if *existing != rp => {
                return Err(RelayError::Conflict("retention policy already exists".into()))
            }
            _ => {
                db.retention_policies.insert(def.name.clone(), rp);
            }
        }
        if def.default {
            db.default_rp = def.name.clone();
        }
        Ok(Vec::new())
    }
}

fn now_nanos() -> Timestamp {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[async_trait]
impl Tsdb for MemoryTsdb {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, request: &WriteRequest) -> Result<()> {
        if !self.is_online() {
            return Err(self.unavailable());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(request)
    }

    async fn query(&self, database: &str, query: &str, epoch: Option<&str>) -> Result<QueryResponse> {
        if !self.is_online() {
            return Err(self.unavailable());
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        let statements = parse_query(query).map_err(|e| RelayError::Tsdb {
            status: 400,
            message: e.to_string(),
        })?;
        let now = now_nanos();
        let results = statements
            .iter()
            .enumerate()
            .map(|(i, stmt)| match self.execute(stmt, database, epoch, now) {
                Ok(series) => StatementResult::ok(i, series),
                Err(e) => StatementResult::error(i, e.to_string()),
            })
            .collect();
        Ok(QueryResponse::from_results(results))
    }

    async fn ping(&self) -> Result<String> {
        if !self.is_online() {
            return Err(self.unavailable());
        }
        Ok(MEMORY_TSDB_VERSION.to_string())
    }
}

/// A set of in-memory TSDBs addressed by location
#[derive(Default)]
pub struct MemoryCluster {
    instances: RwLock<HashMap<String, Arc<MemoryTsdb>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance at `location`, created on first use
    pub fn get(&self, location: &str) -> Arc<MemoryTsdb> {
        if let Some(tsdb) = self.instances.read().get(location) {
            return tsdb.clone();
        }
        self.instances
            .write()
            .entry(location.to_string())
            .or_insert_with(|| Arc::new(MemoryTsdb::new(location)))
            .clone()
    }
}

impl TsdbConnector for MemoryCluster {
    fn connect(&self, location: &str) -> SharedTsdb {
        self.get(location)
    }
}

type Group<'a> = ((String, BTreeMap<String, String>), Vec<RowRef<'a>>);

fn run_select(
    db: &Database,
    stmt: &SelectStatement,
    epoch: Option<&str>,
    now: Timestamp,
) -> Result<Vec<Series>> {
    let mut measurements = BTreeSet::new();
    for source in &stmt.sources {
        measurements.extend(db.resolve(Some(source))?);
    }
    let condition = stmt.condition.as_ref();
    let (lower, upper) = condition
        .map(|c| eval::time_bounds(c, now))
        .unwrap_or((None, None));

    let mut groups: BTreeMap<(String, BTreeMap<String, String>), Vec<RowRef<'_>>> =
        BTreeMap::new();
    for (key, points) in &db.series {
        if !measurements.contains(&key.measurement) {
            continue;
        }
        let tags = group_tags(key, &stmt.dimensions)?;
        for (ts, fields) in points {
            let row = RowRef { key, time: *ts, fields };
            if condition.map(|c| eval::truthy(c, &row, now)).unwrap_or(true) {
                groups
                    .entry((key.measurement.clone(), tags.clone()))
                    .or_default()
                    .push(row);
            }
        }
    }

    let mut out = Vec::new();
    for group in groups {
        let series = if stmt.has_calls() {
            aggregate_series(stmt, group, lower, upper, epoch, now)?
        } else {
            raw_series(stmt, group, epoch, now)
        };
        out.extend(series);
    }
    let skip = stmt.soffset.unwrap_or(0) as usize;
    let take = stmt.slimit.map(|n| n as usize).unwrap_or(usize::MAX);
    Ok(out.into_iter().skip(skip).take(take).collect())
}

fn group_tags(key: &SeriesKey, dimensions: &[Dimension]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for dim in dimensions {
        match dim {
            Dimension::Wildcard => tags.extend(key.tags.clone()),
            Dimension::Tag(t) => {
                tags.insert(t.clone(), key.tags.get(t).cloned().unwrap_or_default());
            }
            Dimension::Regex(pattern) => {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| RelayError::BadRequest(format!("invalid regex: {}", e)))?;
                for (k, v) in &key.tags {
                    if re.is_match(k) {
                        tags.insert(k.clone(), v.clone());
                    }
                }
            }
            Dimension::Time { .. } => {}
        }
    }
    Ok(tags)
}

/// Make duplicate column names unique (`mean`, `mean_1`)
pub(crate) fn unique_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let n = seen.entry(name.clone()).or_insert(0);
            let out = if *n == 0 { name.clone() } else { format!("{}_{}", name, n) };
            *n += 1;
            out
        })
        .collect()
}

fn finish_rows(stmt: &SelectStatement, rows: &mut Vec<Vec<Value>>) {
    if stmt.order_desc {
        rows.reverse();
    }
    let offset = stmt.offset.unwrap_or(0) as usize;
    rows.drain(..offset.min(rows.len()));
    if let Some(limit) = stmt.limit {
        rows.truncate(limit as usize);
    }
}

fn raw_series(
    stmt: &SelectStatement,
    ((name, tags), mut rows): Group<'_>,
    epoch: Option<&str>,
    now: Timestamp,
) -> Option<Series> {
    rows.sort_by_key(|r| r.time);

    // wildcard expands to every field plus tags not grouped on
    let mut columns: Vec<(String, Option<&Expr>)> = Vec::new();
    for field in &stmt.fields {
        if field.expr == Expr::Wildcard {
            let mut keys: BTreeSet<String> = BTreeSet::new();
            for row in &rows {
                keys.extend(row.fields.iter().map(|(k, _)| k.clone()));
                keys.extend(row.key.tags.keys().filter(|k| !tags.contains_key(*k)).cloned());
            }
            columns.extend(keys.into_iter().map(|k| (k, None)));
        } else {
            columns.push((field.name(), Some(&field.expr)));
        }
    }

    let mut values: Vec<Vec<Value>> = Vec::new();
    for row in &rows {
        let mut out = vec![format_time(row.time, epoch)];
        let mut any = false;
        for (col, expr) in &columns {
            let v = match expr {
                Some(e) => eval::eval(e, row, now),
                None => eval::eval(&Expr::VarRef(col.clone()), row, now),
            };
            any |= v.is_some();
            out.push(v.map(|v| v.to_json()).unwrap_or(Value::Null));
        }
        if any {
            values.push(out);
        }
    }
    finish_rows(stmt, &mut values);
    if values.is_empty() {
        return None;
    }
    let names = unique_names(columns.into_iter().map(|(n, _)| n).collect());
    let mut series = Series {
        name,
        tags,
        columns: vec!["time".to_string()],
        values,
    };
    series.columns.extend(names);
    Some(series)
}

/// Functions returning several rows per bucket
fn multi_row_call(stmt: &SelectStatement) -> Option<(&str, &[Expr])> {
    if stmt.fields.len() != 1 {
        return None;
    }
    match stmt.fields[0].expr.unparen() {
        Expr::Call { name, args }
            if ["top", "bottom", "distinct"]
                .iter()
                .any(|f| name.eq_ignore_ascii_case(f)) =>
        {
            Some((name.as_str(), args.as_slice()))
        }
        _ => None,
    }
}

fn bucket_start(time: Timestamp, interval: i64, offset: i64) -> Timestamp {
    (time - offset).div_euclid(interval) * interval + offset
}

fn aggregate_series(
    stmt: &SelectStatement,
    ((name, tags), rows): Group<'_>,
    lower: Option<i64>,
    upper: Option<i64>,
    epoch: Option<&str>,
    now: Timestamp,
) -> Result<Option<Series>> {
    let gbt = stmt.group_by_time();
    let mut buckets: BTreeMap<Timestamp, Vec<RowRef<'_>>> = BTreeMap::new();
    match gbt {
        Some((interval, offset)) if interval > 0 => {
            for row in rows {
                buckets
                    .entry(bucket_start(row.time, interval, offset))
                    .or_default()
                    .push(row);
            }
        }
        Some(_) => return Err(RelayError::BadRequest("GROUP BY time interval must be positive".into())),
        None => {
            buckets.insert(lower.unwrap_or(0), rows);
        }
    }
    for rows in buckets.values_mut() {
        rows.sort_by_key(|r| r.time);
    }

    let mut values: Vec<Vec<Value>> = Vec::new();
    let columns: Vec<String>;
    if let Some((func, args)) = multi_row_call(stmt) {
        columns = vec![stmt.fields[0].alias.clone().unwrap_or_else(|| func.to_lowercase())];
        for (start, rows) in &buckets {
            for (time, value) in selector_rows(func, args, rows, *start)? {
                values.push(vec![format_time(time, epoch), value.to_json()]);
            }
        }
    } else {
        columns = unique_names(stmt.fields.iter().map(|f| f.name()).collect());
        let first = buckets.keys().next().copied();
        let last = buckets.keys().next_back().copied();
        if let (Some((interval, offset)), Some(first), Some(last)) = (gbt, first, last) {
            let start = lower.map(|l| bucket_start(l, interval, offset)).unwrap_or(first);
            let end = upper.map(|u| bucket_start(u, interval, offset)).unwrap_or(last);
            if end >= start && (end - start) / interval < MAX_FILL_BUCKETS {
                let mut t = start;
                while t <= end {
                    buckets.entry(t).or_default();
                    t += interval;
                }
            }
        }
        for (start, rows) in &buckets {
            let mut row = vec![format_time(*start, epoch)];
            for field in &stmt.fields {
                let v = aggregate(&field.expr, rows, now)?;
                row.push(v.map(|v| v.to_json()).unwrap_or(Value::Null));
            }
            values.push(row);
        }
        if gbt.is_some() {
            let fill = if stmt.fill == Fill::Default { Fill::Null } else { stmt.fill.clone() };
            apply_fill(&mut values, &fill);
        }
    }

    finish_rows(stmt, &mut values);
    if values.is_empty() {
        return Ok(None);
    }
    let mut all_columns = vec!["time".to_string()];
    all_columns.extend(columns);
    Ok(Some(Series {
        name,
        tags,
        columns: all_columns,
        values,
    }))
}

fn call_field(name: &str, args: &[Expr]) -> Result<String> {
    match args.first().map(|a| a.unparen()) {
        Some(Expr::VarRef(field)) => Ok(field.clone()),
        _ => Err(RelayError::BadRequest(format!(
            "expected field argument in {}()",
            name
        ))),
    }
}

fn numeric_arg(args: &[Expr], idx: usize) -> Option<f64> {
    match args.get(idx).map(|a| a.unparen()) {
        Some(Expr::Integer(n)) => Some(*n as f64),
        Some(Expr::Number(n)) => Some(*n),
        _ => None,
    }
}

/// Evaluate an aggregate expression over the rows of one bucket
fn aggregate(expr: &Expr, rows: &[RowRef<'_>], now: Timestamp) -> Result<Option<FieldValue>> {
    match expr {
        Expr::Call { name, args } => {
            let lname = name.to_ascii_lowercase();
            if lname == "now" {
                return Ok(Some(FieldValue::Integer(now)));
            }
            if let (true, Some(Expr::Call { name: inner, args: inner_args })) =
                (lname == "count", args.first().map(|a| a.unparen()))
            {
                if inner.eq_ignore_ascii_case("distinct") {
                    let field = call_field(inner, inner_args)?;
                    let distinct: HashSet<String> = rows
                        .iter()
                        .filter_map(|r| r.fields.get(&field))
                        .map(|v| v.to_json().to_string())
                        .collect();
                    return Ok((!distinct.is_empty())
                        .then(|| FieldValue::Integer(distinct.len() as i64)));
                }
            }
            let field = call_field(&lname, args)?;
            let mut acc = new_accumulator(&lname, numeric_arg(args, 1))?;
            for row in rows {
                if let Some(v) = row.fields.get(&field) {
                    acc.add(row.time, v);
                }
            }
            Ok(acc.result())
        }
        Expr::Binary { op, lhs, rhs } if op.is_arithmetic() => {
            let (l, r) = (aggregate(lhs, rows, now)?, aggregate(rhs, rows, now)?);
            Ok(match (l, r) {
                (Some(l), Some(r)) => eval::arith(*op, l, r),
                _ => None,
            })
        }
        Expr::Paren(inner) => aggregate(inner, rows, now),
        Expr::VarRef(_) | Expr::Wildcard => Err(RelayError::BadRequest(
            "mixing aggregate and non-aggregate queries is not supported".into(),
        )),
        other => Ok(eval::eval_const(other, now)),
    }
}

/// Rows produced by top(), bottom() and distinct() for one bucket
fn selector_rows(
    func: &str,
    args: &[Expr],
    rows: &[RowRef<'_>],
    bucket: Timestamp,
) -> Result<Vec<(Timestamp, FieldValue)>> {
    let field = call_field(func, args)?;
    let values = rows
        .iter()
        .filter_map(|r| r.fields.get(&field).map(|v| (r.time, v.clone())));
    if func.eq_ignore_ascii_case("distinct") {
        let mut seen = HashSet::new();
        return Ok(values
            .filter(|(_, v)| seen.insert(v.to_json().to_string()))
            .map(|(_, v)| (bucket, v))
            .collect());
    }
    let k = match args.get(1).map(|a| a.unparen()) {
        Some(Expr::Integer(k)) if *k > 0 => *k as usize,
        _ => {
            return Err(RelayError::BadRequest(format!(
                "{}() requires a positive integer limit",
                func
            )))
        }
    };
    let top = func.eq_ignore_ascii_case("top");
    let mut numeric: Vec<(Timestamp, FieldValue, f64)> = values
        .filter_map(|(t, v)| v.as_f64().map(|f| (t, v, f)))
        .collect();
    numeric.sort_by(|a, b| {
        let by_value = if top { b.2.total_cmp(&a.2) } else { a.2.total_cmp(&b.2) };
        by_value.then(a.0.cmp(&b.0))
    });
    numeric.truncate(k);
    numeric.sort_by_key(|(t, _, _)| *t);
    Ok(numeric.into_iter().map(|(t, v, _)| (t, v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::query_series;
    use serde_json::json;

    async fn tsdb_with(lines: &str) -> MemoryTsdb {
        let tsdb = MemoryTsdb::new("mem:1");
        tsdb.query("", "CREATE DATABASE db", None).await.unwrap();
        tsdb.write(&WriteRequest::new("db", lines.to_string())).await.unwrap();
        tsdb
    }

    const TREASURES: &str = "treasures,type=gold value=100 86400000000000\n\
                             treasures,type=silver value=50 86400000000001\n\
                             treasures,type=trash value=0 172800000000000";

    #[tokio::test]
    async fn test_write_requires_database() {
        let tsdb = MemoryTsdb::new("mem:1");
        let err = tsdb
            .write(&WriteRequest::new("nope", "cpu value=1 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Tsdb { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let tsdb = tsdb_with(TREASURES).await;
        tsdb.write(&WriteRequest::new("db", TREASURES)).await.unwrap();
        assert_eq!(tsdb.points("db").len(), 3);
    }

    #[tokio::test]
    async fn test_group_by_time_with_fill() {
        let tsdb = tsdb_with(TREASURES).await;
        let series = query_series(
            &tsdb,
            "db",
            "SELECT mean(value), count(value) FROM treasures GROUP BY time(1d)",
        )
        .await
        .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].columns, vec!["time", "mean", "count"]);
        assert_eq!(
            series[0].values,
            vec![
                vec![json!(86_400_000_000_000i64), json!(75.0), json!(2)],
                vec![json!(172_800_000_000_000i64), json!(0.0), json!(1)],
            ]
        );
    }

    #[tokio::test]
    async fn test_where_and_group_by_tag() {
        let tsdb = tsdb_with(TREASURES).await;
        let series = query_series(
            &tsdb,
            "db",
            "SELECT sum(value) FROM treasures WHERE type = 'gold' OR type = 'silver' GROUP BY type",
        )
        .await
        .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].tags.get("type").map(String::as_str), Some("gold"));
        assert_eq!(series[0].values[0][1], json!(100.0));
    }

    #[tokio::test]
    async fn test_raw_select_paging() {
        let tsdb = tsdb_with(TREASURES).await;
        let series = query_series(&tsdb, "db", "SELECT * FROM treasures LIMIT 2 OFFSET 1")
            .await
            .unwrap();
        assert_eq!(series[0].columns, vec!["time", "type", "value"]);
        assert_eq!(series[0].values.len(), 2);
        assert_eq!(series[0].values[0][1], json!("silver"));

        let grouped = query_series(&tsdb, "db", "SELECT * FROM treasures GROUP BY *")
            .await
            .unwrap();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].columns, vec!["time", "value"]);
    }

    #[tokio::test]
    async fn test_top_and_distinct() {
        let tsdb = tsdb_with(TREASURES).await;
        let top = query_series(&tsdb, "db", "SELECT top(value, 2) FROM treasures")
            .await
            .unwrap();
        assert_eq!(top[0].values.len(), 2);
        assert_eq!(top[0].values[0][1], json!(100.0));

        let distinct = query_series(&tsdb, "db", "SELECT count(distinct(value)) FROM treasures")
            .await
            .unwrap();
        assert_eq!(distinct[0].values[0][1], json!(3));
    }

    #[tokio::test]
    async fn test_show_statements() {
        let tsdb = tsdb_with(TREASURES).await;
        let series = query_series(&tsdb, "db", "SHOW SERIES FROM treasures WHERE type = 'gold'")
            .await
            .unwrap();
        assert_eq!(series[0].strings("key"), vec!["treasures,type=gold".to_string()]);

        let keys = query_series(&tsdb, "db", "SHOW TAG KEYS").await.unwrap();
        assert_eq!(keys[0].strings("tagKey"), vec!["type".to_string()]);

        let fields = query_series(&tsdb, "db", "SHOW FIELD KEYS").await.unwrap();
        assert_eq!(fields[0].values[0], vec![json!("value"), json!("float")]);

        let rps = query_series(&tsdb, "db", "SHOW RETENTION POLICIES ON db").await.unwrap();
        assert_eq!(rps[0].values[0][0], json!("autogen"));
        assert_eq!(rps[0].values[0][2], json!("168h0m0s"));
    }

    #[tokio::test]
    async fn test_drop_series_and_delete() {
        let tsdb = tsdb_with(TREASURES).await;
        tsdb.query("db", "DROP SERIES FROM treasures WHERE type = 'gold'", None)
            .await
            .unwrap();
        assert_eq!(tsdb.points("db").len(), 2);
        tsdb.query("db", "DELETE FROM treasures WHERE time > 100000000000000", None)
            .await
            .unwrap();
        assert_eq!(tsdb.points("db").len(), 1);
    }

    #[tokio::test]
    async fn test_offline() {
        let tsdb = tsdb_with(TREASURES).await;
        tsdb.set_online(false);
        let err = tsdb.ping().await.unwrap_err();
        assert!(err.is_retryable());
        tsdb.set_online(true);
        assert_eq!(tsdb.ping().await.unwrap(), MEMORY_TSDB_VERSION);
    }

    #[tokio::test]
    async fn test_cluster_hands_out_same_instance() {
        let cluster = MemoryCluster::new();
        cluster.get("a:1").set_online(false);
        assert!(cluster.connect("a:1").ping().await.is_err());
        assert!(cluster.connect("b:1").ping().await.is_ok());
    }
}
