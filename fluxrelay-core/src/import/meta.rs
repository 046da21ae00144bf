//! Schema snapshot of a source TSDB

use crate::influxql::ast::quote_ident;
use crate::tsdb::{parse_go_duration, query_series, Tsdb};
use crate::{Result, SeriesKey};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Retention policy as listed by `SHOW RETENTION POLICIES`
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub duration: i64,
    pub shard_duration: i64,
    pub replication: u32,
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementInfo {
    pub name: String,
    pub tag_keys: Vec<String>,
    /// Field name to `float`, `integer`, `boolean` or `string`
    pub field_types: BTreeMap<String, String>,
    pub series: Vec<SeriesKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseInfo {
    pub name: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
    /// `(name, CREATE CONTINUOUS QUERY ...)`
    pub continuous_queries: Vec<(String, String)>,
    pub measurements: Vec<MeasurementInfo>,
}

impl DatabaseInfo {
    pub fn default_retention_policy(&self) -> Option<&str> {
        self.retention_policies
            .iter()
            .find(|rp| rp.default)
            .map(|rp| rp.name.as_str())
    }
}

/// Everything the importer needs to know about one source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMeta {
    pub location: String,
    pub databases: Vec<DatabaseInfo>,
}

const INTERNAL_DATABASE: &str = "_internal";

fn bool_at(row: &[Value], idx: Option<usize>) -> bool {
    idx.and_then(|i| row.get(i)).and_then(Value::as_bool).unwrap_or(false)
}

fn str_at(row: &[Value], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn retention_policies(tsdb: &dyn Tsdb, db: &str) -> Result<Vec<RetentionPolicyInfo>> {
    let mut out = Vec::new();
    let query = format!("SHOW RETENTION POLICIES ON {}", quote_ident(db));
    for series in query_series(tsdb, db, &query).await? {
        let name = series.column("name");
        let duration = series.column("duration");
        let shard = series.column("shardGroupDuration");
        let replicas = series.column("replicaN");
        let default = series.column("default");
        for row in &series.values {
            out.push(RetentionPolicyInfo {
                name: str_at(row, name),
                duration: parse_go_duration(&str_at(row, duration)).unwrap_or(0),
                shard_duration: parse_go_duration(&str_at(row, shard)).unwrap_or(0),
                replication: replicas
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32,
                default: bool_at(row, default),
            });
        }
    }
    Ok(out)
}

/// Read databases, retention policies, continuous queries, tag keys,
/// field types and series from `tsdb`
pub async fn fetch(tsdb: &dyn Tsdb) -> Result<SourceMeta> {
    let databases: Vec<String> = query_series(tsdb, "", "SHOW DATABASES")
        .await?
        .iter()
        .flat_map(|s| s.strings("name"))
        .filter(|name| name != INTERNAL_DATABASE)
        .collect();

    let mut continuous: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for series in query_series(tsdb, "", "SHOW CONTINUOUS QUERIES").await? {
        let name = series.column("name");
        let query = series.column("query");
        let entry = continuous.entry(series.name.clone()).or_default();
        for row in &series.values {
            entry.push((str_at(row, name), str_at(row, query)));
        }
    }

    let mut meta = SourceMeta {
        location: tsdb.location().to_string(),
        databases: Vec::new(),
    };
    for db in databases {
        let on = quote_ident(&db);
        let mut measurements: BTreeMap<String, MeasurementInfo> = BTreeMap::new();
        for series in query_series(tsdb, &db, &format!("SHOW MEASUREMENTS ON {}", on)).await? {
            for name in series.strings("name") {
                measurements.insert(
                    name.clone(),
                    MeasurementInfo {
                        name,
                        ..Default::default()
                    },
                );
            }
        }
        for series in query_series(tsdb, &db, &format!("SHOW TAG KEYS ON {}", on)).await? {
            if let Some(m) = measurements.get_mut(&series.name) {
                m.tag_keys = series.strings("tagKey");
            }
        }
        for series in query_series(tsdb, &db, &format!("SHOW FIELD KEYS ON {}", on)).await? {
            if let Some(m) = measurements.get_mut(&series.name) {
                m.field_types = series
                    .strings("fieldKey")
                    .into_iter()
                    .zip(series.strings("fieldType"))
                    .collect();
            }
        }
        for series in query_series(tsdb, &db, &format!("SHOW SERIES ON {}", on)).await? {
            for key in series.strings("key") {
                let Some(key) = SeriesKey::parse_canonical(&key) else {
                    debug!(db = %db, key = %key, "skipping unparseable series key");
                    continue;
                };
                if let Some(m) = measurements.get_mut(&key.measurement) {
                    m.series.push(key);
                }
            }
        }

        meta.databases.push(DatabaseInfo {
            retention_policies: retention_policies(tsdb, &db).await?,
            continuous_queries: continuous.remove(&db).unwrap_or_default(),
            measurements: measurements.into_values().collect(),
            name: db,
        });
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::{MemoryTsdb, WriteRequest};

    #[tokio::test]
    async fn test_fetch_schema() {
        let tsdb = MemoryTsdb::new("a:1");
        tsdb.query("", "CREATE DATABASE db", None).await.unwrap();
        tsdb.query("db", "CREATE RETENTION POLICY week ON db DURATION 7d REPLICATION 1", None)
            .await
            .unwrap();
        tsdb.write(&WriteRequest::new(
            "db",
            "treasures,type=gold value=100 1\ntreasures,type=trash value=0 2\ncpu load=1 3",
        ))
        .await
        .unwrap();

        let meta = fetch(&tsdb).await.unwrap();
        assert_eq!(meta.location, "a:1");
        assert_eq!(meta.databases.len(), 1);
        let db = &meta.databases[0];
        assert_eq!(db.default_retention_policy(), Some("autogen"));
        let week = db.retention_policies.iter().find(|rp| rp.name == "week").unwrap();
        assert_eq!(week.duration, 7 * 86_400_000_000_000);

        let treasures = db.measurements.iter().find(|m| m.name == "treasures").unwrap();
        assert_eq!(treasures.tag_keys, vec!["type"]);
        assert_eq!(treasures.series.len(), 2);
        assert_eq!(treasures.field_types.get("value").map(String::as_str), Some("float"));

        let cpu = db.measurements.iter().find(|m| m.name == "cpu").unwrap();
        assert!(cpu.tag_keys.is_empty());
        assert_eq!(cpu.series, vec![SeriesKey::new("cpu")]);
    }
}
