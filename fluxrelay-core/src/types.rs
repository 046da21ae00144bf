//! Core types for FluxRelay

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// A point on the hash ring; also the label of a partition
pub type Token = u32;

/// Lifecycle state of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Registered, importing data for reserved tokens
    Joining,
    /// Serving reads and writes
    Up,
    /// Restarted with outstanding hints, waiting for holders to replay
    Recovering,
    /// Removed by an administrator, tokens being redistributed
    Removed,
    /// Registered but owning nothing
    Idle,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Up => "up",
            NodeStatus::Recovering => "recovering",
            NodeStatus::Removed => "removed",
            NodeStatus::Idle => "idle",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster member as persisted under `nodes/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member name
    pub name: String,
    /// host:port of the member's local TSDB
    pub location: String,
    /// Tokens owned by this member
    #[serde(default)]
    pub tokens: BTreeSet<Token>,
    /// Lifecycle state
    pub status: NodeStatus,
}

impl Member {
    /// Create a freshly registered member
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            tokens: BTreeSet::new(),
            status: NodeStatus::Joining,
        }
    }

    /// Builder-style status override
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Check if the member serves reads
    pub fn is_readable(&self) -> bool {
        self.status == NodeStatus::Up
    }
}

/// Series key combining measurement and tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Measurement name (e.g., "temperature", "cpu_usage")
    pub measurement: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Tag values in the shape the partitioner consumes
    pub fn tag_values(&self) -> BTreeMap<String, Vec<String>> {
        self.tags
            .iter()
            .map(|(k, v)| (k.clone(), vec![v.clone()]))
            .collect()
    }

    /// Create a canonical string representation (`m,k1=v1,k2=v2`)
    pub fn canonical(&self) -> String {
        let mut s = self.measurement.clone();
        for (k, v) in &self.tags {
            s.push(',');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Parse the `key` column emitted by `SHOW SERIES`
    pub fn parse_canonical(s: &str) -> Option<Self> {
        let parts = split_unescaped(s, ',');
        let mut iter = parts.into_iter();
        let measurement = unescape(&iter.next()?);
        if measurement.is_empty() {
            return None;
        }
        let mut key = SeriesKey::new(measurement);
        for part in iter {
            let kv = split_unescaped(&part, '=');
            if kv.len() != 2 {
                return None;
            }
            key.tags.insert(unescape(&kv[0]), unescape(&kv[1]));
        }
        Some(key)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(n) = chars.next() {
                current.push(n);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Field values container
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Fields(pub BTreeMap<String, FieldValue>);

impl Fields {
    /// Create empty fields
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a field
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Type name as reported by `SHOW FIELD KEYS`
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Integer(_) => "integer",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::String(_) => "string",
        }
    }

    /// JSON representation used in query responses
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Float(v) => serde_json::json!(v),
            FieldValue::Integer(v) => serde_json::json!(v),
            FieldValue::Boolean(v) => serde_json::json!(v),
            FieldValue::String(v) => serde_json::json!(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// A complete point: series key, fields and nanosecond timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Series key (measurement + tags)
    pub key: SeriesKey,
    /// Field values
    pub fields: Fields,
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
}

impl Point {
    /// Create a new point
    pub fn new(key: SeriesKey, fields: Fields, timestamp: Timestamp) -> Self {
        Self {
            key,
            fields,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key() {
        let key = SeriesKey::new("temperature")
            .with_tag("sensor", "sensor-001")
            .with_tag("location", "building-a");

        assert_eq!(
            key.canonical(),
            "temperature,location=building-a,sensor=sensor-001"
        );
    }

    #[test]
    fn test_parse_canonical_series() {
        let key = SeriesKey::parse_canonical("treasures,type=gold,vault=a\\,b").unwrap();
        assert_eq!(key.measurement, "treasures");
        assert_eq!(key.tags.get("type"), Some(&"gold".to_string()));
        assert_eq!(key.tags.get("vault"), Some(&"a,b".to_string()));

        let bare = SeriesKey::parse_canonical("cpu").unwrap();
        assert!(bare.tags.is_empty());
        assert!(SeriesKey::parse_canonical("").is_none());
    }

    #[test]
    fn test_member_json() {
        let mut member = Member::new("n1", "localhost:8086").with_status(NodeStatus::Up);
        member.tokens.insert(42);
        let json = serde_json::to_string(&member).unwrap();
        assert!(json.contains("\"status\":\"up\""));
        let back: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(back, member);
        assert!(back.is_readable());
    }
}
