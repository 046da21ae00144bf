//! TSDB collaborator
//!
//! Every member fronts one TSDB speaking the InfluxDB 1.x HTTP API. The
//! core only needs three calls (write, query, ping), abstracted as [`Tsdb`]
//! so the in-memory engine can stand in for a real process.

pub mod aggregates;
pub mod eval;
pub mod http;
pub mod line_protocol;
pub mod memory;

pub use http::{HttpConnector, HttpTsdb};
pub use memory::{MemoryCluster, MemoryTsdb};

use crate::influxql::Fill;
use crate::{RelayError, Result, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A line-protocol write forwarded to a TSDB
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub database: String,
    pub retention_policy: String,
    pub precision: String,
    pub body: Bytes,
}

impl WriteRequest {
    pub fn new(database: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            database: database.into(),
            retention_policy: String::new(),
            precision: String::new(),
            body: body.into(),
        }
    }

    pub fn with_retention_policy(mut self, rp: impl Into<String>) -> Self {
        self.retention_policy = rp.into();
        self
    }

    pub fn with_precision(mut self, precision: impl Into<String>) -> Self {
        self.precision = precision.into();
        self
    }
}

/// One result series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl Series {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column as strings, skipping non-strings
    pub fn strings(&self, column: &str) -> Vec<String> {
        let Some(idx) = self.column(column) else {
            return Vec::new();
        };
        self.values
            .iter()
            .filter_map(|row| row.get(idx).and_then(|v| v.as_str()).map(String::from))
            .collect()
    }
}

/// Result of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub statement_id: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatementResult {
    pub fn ok(statement_id: usize, series: Vec<Series>) -> Self {
        Self {
            statement_id,
            series,
            error: None,
        }
    }

    pub fn error(statement_id: usize, message: impl Into<String>) -> Self {
        Self {
            statement_id,
            series: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// Series, or the statement error as a TSDB error
    pub fn into_series(self) -> Result<Vec<Series>> {
        match self.error {
            Some(message) => Err(RelayError::Tsdb { status: 400, message }),
            None => Ok(self.series),
        }
    }
}

/// Response body of `/query`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn from_results(results: Vec<StatementResult>) -> Self {
        Self {
            results,
            error: None,
        }
    }

    /// Series of the first statement
    pub fn into_series(self) -> Result<Vec<Series>> {
        if let Some(message) = self.error {
            return Err(RelayError::Tsdb { status: 400, message });
        }
        match self.results.into_iter().next() {
            Some(result) => result.into_series(),
            None => Ok(Vec::new()),
        }
    }
}

/// A TSDB instance
#[async_trait]
pub trait Tsdb: Send + Sync {
    /// host:port this handle talks to
    fn location(&self) -> &str;

    async fn write(&self, request: &WriteRequest) -> Result<()>;

    /// Run `query` against `database`; `epoch` selects integer timestamps
    async fn query(&self, database: &str, query: &str, epoch: Option<&str>) -> Result<QueryResponse>;

    /// Version string reported by the instance
    async fn ping(&self) -> Result<String>;
}

pub type SharedTsdb = Arc<dyn Tsdb>;

/// Maps a data location to a TSDB handle
pub trait TsdbConnector: Send + Sync {
    fn connect(&self, location: &str) -> SharedTsdb;
}

pub type SharedConnector = Arc<dyn TsdbConnector>;

/// Run a single statement with nanosecond timestamps and return its series
pub async fn query_series(tsdb: &dyn Tsdb, database: &str, query: &str) -> Result<Vec<Series>> {
    tsdb.query(database, query, Some("ns")).await?.into_series()
}

/// Nanoseconds per unit of an `epoch` query parameter
pub fn epoch_divisor(epoch: &str) -> Result<i64> {
    line_protocol::precision_multiplier(epoch)
}

/// Render a nanosecond timestamp the way `/query` does
pub fn format_time(ns: Timestamp, epoch: Option<&str>) -> Value {
    match epoch {
        Some(e) => match epoch_divisor(e) {
            Ok(div) => Value::from(ns.div_euclid(div)),
            Err(_) => Value::from(ns),
        },
        None => {
            let secs = ns.div_euclid(1_000_000_000);
            let nanos = ns.rem_euclid(1_000_000_000) as u32;
            match DateTime::from_timestamp(secs, nanos) {
                Some(t) => Value::from(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => Value::from(ns),
            }
        }
    }
}

/// Read back a timestamp from a `/query` row
pub fn parse_time(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|t| t.timestamp_nanos_opt()),
        _ => None,
    }
}

/// Go-style duration as printed by `SHOW RETENTION POLICIES`
pub fn format_go_duration(ns: i64) -> String {
    if ns == 0 {
        return "0s".into();
    }
    let secs = ns / 1_000_000_000;
    let frac = ns % 1_000_000_000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let seconds = if frac == 0 {
        format!("{}s", s)
    } else {
        let digits = format!("{:09}", frac);
        format!("{}.{}s", s, digits.trim_end_matches('0'))
    };
    if h > 0 {
        format!("{}h{}m{}", h, m, seconds)
    } else if m > 0 {
        format!("{}m{}", m, seconds)
    } else {
        seconds
    }
}

/// Parse a Go-style duration (`168h0m0s`, `1.5s`, `500ms`)
pub fn parse_go_duration(s: &str) -> Result<i64> {
    let invalid = || RelayError::BadRequest(format!("invalid duration {}", s));
    if s == "0" {
        return Ok(0);
    }
    let mut total: f64 = 0.0;
    let mut rest = s;
    if rest.is_empty() {
        return Err(invalid());
    }
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let value: f64 = rest[..num_end].parse().map_err(|_| invalid())?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        total += value * unit;
        rest = &rest[unit_end..];
    }
    Ok(total.round() as i64)
}

/// Apply a fill option to rows whose first column is time
pub fn apply_fill(rows: &mut Vec<Vec<Value>>, fill: &Fill) {
    match fill {
        Fill::Default | Fill::Null => {}
        Fill::None => rows.retain(|row| row.iter().skip(1).any(|v| !v.is_null())),
        Fill::Value(v) => {
            let fill_value = if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                Value::from(*v as i64)
            } else {
                Value::from(*v)
            };
            for row in rows.iter_mut() {
                for cell in row.iter_mut().skip(1) {
                    if cell.is_null() {
                        *cell = fill_value.clone();
                    }
                }
            }
        }
        Fill::Previous => {
            let width = rows.first().map(|r| r.len()).unwrap_or(0);
            for col in 1..width {
                let mut last = Value::Null;
                for row in rows.iter_mut() {
                    if row[col].is_null() {
                        row[col] = last.clone();
                    } else {
                        last = row[col].clone();
                    }
                }
            }
        }
        Fill::Linear => {
            let width = rows.first().map(|r| r.len()).unwrap_or(0);
            for col in 1..width {
                let known: Vec<(usize, f64, f64)> = rows
                    .iter()
                    .enumerate()
                    .filter_map(|(i, row)| {
                        let t = parse_time(&row[0])? as f64;
                        row[col].as_f64().map(|v| (i, t, v))
                    })
                    .collect();
                for pair in known.windows(2) {
                    let (i0, t0, v0) = pair[0];
                    let (i1, t1, v1) = pair[1];
                    for row in rows.iter_mut().take(i1).skip(i0 + 1) {
                        if let Some(t) = parse_time(&row[0]) {
                            let ratio = (t as f64 - t0) / (t1 - t0);
                            row[col] = Value::from(v0 + (v1 - v0) * ratio);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_json_shape() {
        let mut series = Series::new("cpu", &["time", "mean"]);
        series.values.push(vec![json!(0), json!(1.5)]);
        let resp = QueryResponse::from_results(vec![StatementResult::ok(0, vec![series])]);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"results": [{"statement_id": 0, "series": [
                {"name": "cpu", "columns": ["time", "mean"], "values": [[0, 1.5]]}
            ]}]})
        );

        let empty: QueryResponse = serde_json::from_str(r#"{"results":[{"statement_id":0}]}"#).unwrap();
        assert!(empty.into_series().unwrap().is_empty());
    }

    #[test]
    fn test_statement_error_surfaces() {
        let resp = QueryResponse::from_results(vec![StatementResult::error(0, "database not found")]);
        assert!(matches!(resp.into_series(), Err(RelayError::Tsdb { status: 400, .. })));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(1_000_000_000, Some("s")), json!(1));
        assert_eq!(format_time(1_500, Some("ns")), json!(1500));
        assert_eq!(format_time(0, None), json!("1970-01-01T00:00:00Z"));
        assert_eq!(parse_time(&json!("1970-01-01T00:00:01Z")), Some(1_000_000_000));
    }

    #[test]
    fn test_go_durations() {
        let week = 7 * 86_400_000_000_000;
        assert_eq!(format_go_duration(week), "168h0m0s");
        assert_eq!(format_go_duration(0), "0s");
        assert_eq!(format_go_duration(90_000_000_000), "1m30s");
        assert_eq!(format_go_duration(1_500_000_000), "1.5s");
        assert_eq!(parse_go_duration("168h0m0s").unwrap(), week);
        assert_eq!(parse_go_duration("1.5s").unwrap(), 1_500_000_000);
        assert_eq!(parse_go_duration("500ms").unwrap(), 500_000_000);
        assert!(parse_go_duration("forever").is_err());
    }

    #[test]
    fn test_fill() {
        let rows = vec![
            vec![json!(0), json!(1.0)],
            vec![json!(10), Value::Null],
            vec![json!(20), json!(3.0)],
        ];

        let mut none = rows.clone();
        apply_fill(&mut none, &Fill::None);
        assert_eq!(none.len(), 2);

        let mut zero = rows.clone();
        apply_fill(&mut zero, &Fill::Value(0.0));
        assert_eq!(zero[1][1], json!(0));

        let mut prev = rows.clone();
        apply_fill(&mut prev, &Fill::Previous);
        assert_eq!(prev[1][1], json!(1.0));

        let mut linear = rows;
        apply_fill(&mut linear, &Fill::Linear);
        assert_eq!(linear[1][1], json!(2.0));
    }
}
