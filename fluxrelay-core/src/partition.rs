//! Partitioner
//!
//! Per-(database, measurement) partition keys. A key names the tags whose
//! values are concatenated (in key order) and hashed to a ring token. A key
//! with an empty measurement is a wildcard over the whole database.

use crate::hash::hash_str;
use crate::{RelayError, Result, Token};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Partition key for a database or a single measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKey {
    pub database: String,
    /// Empty for a database-wide key
    #[serde(default)]
    pub measurement: String,
    /// Tags participating in hashing, in order
    pub tags: Vec<String>,
}

impl PartitionKey {
    pub fn new(
        database: impl Into<String>,
        measurement: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            database: database.into(),
            measurement: measurement.into(),
            tags,
        }
    }

    /// Identifier `db.measurement`, unique per key
    pub fn id(&self) -> String {
        key_id(&self.database, &self.measurement)
    }
}

/// Identifier of the key covering `(database, measurement)`
pub fn key_id(database: &str, measurement: &str) -> String {
    format!("{}.{}", database, measurement)
}

/// Tag values of a series or point, keyed by tag name
pub type TagValues = BTreeMap<String, Vec<String>>;

/// Hash the tag values selected by `key` to a token
pub fn get_hash(key: &PartitionKey, values: &TagValues) -> Result<Token> {
    let missing = missing_tags(key, values);
    if !missing.is_empty() {
        return Err(RelayError::PartitionValidation { missing });
    }

    let mut compound = String::new();
    for tag in &key.tags {
        match values.get(tag).map(Vec::as_slice) {
            Some([single]) => compound.push_str(single),
            _ => {
                return Err(RelayError::BadRequest(format!(
                    "tag {} has multiple values for partition key {}",
                    tag,
                    key.id()
                )))
            }
        }
    }
    Ok(hash_str(&compound))
}

/// Whether every tag required by `key` has a non-empty value
pub fn fulfills_key(key: &PartitionKey, values: &TagValues) -> bool {
    missing_tags(key, values).is_empty()
}

/// Tags required by `key` that are absent or empty in `values`
pub fn missing_tags(key: &PartitionKey, values: &TagValues) -> Vec<String> {
    key.tags
        .iter()
        .filter(|tag| {
            !values
                .get(*tag)
                .map(|vs| !vs.is_empty() && vs.iter().all(|v| !v.is_empty()))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// In-memory collection of partition keys, synced from the metadata store
#[derive(Debug, Default)]
pub struct Partitioner {
    keys: RwLock<HashMap<String, PartitionKey>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, key: PartitionKey) {
        self.keys.write().insert(key.id(), key);
    }

    pub fn add_keys(&self, keys: impl IntoIterator<Item = PartitionKey>) {
        let mut map = self.keys.write();
        for key in keys {
            map.insert(key.id(), key);
        }
    }

    /// Remove the key with the given identifier
    pub fn remove_key(&self, id: &str) -> Option<PartitionKey> {
        self.keys.write().remove(id)
    }

    /// Replace every key (watch resync)
    pub fn replace_all(&self, keys: impl IntoIterator<Item = PartitionKey>) {
        let mut map = self.keys.write();
        map.clear();
        for key in keys {
            map.insert(key.id(), key);
        }
    }

    /// Exact `(db, m)` key, else the wildcard `(db, "")` key
    pub fn get_key_by_measurement(&self, database: &str, measurement: &str) -> Option<PartitionKey> {
        let keys = self.keys.read();
        keys.get(&key_id(database, measurement))
            .or_else(|| keys.get(&key_id(database, "")))
            .cloned()
    }

    /// All keys sorted by identifier
    pub fn keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.keys.read().values().cloned().collect();
        keys.sort_by_key(|k| k.id());
        keys
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> TagValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect()
    }

    #[test]
    fn test_get_hash_concatenates_in_key_order() {
        let key = PartitionKey::new("db", "cpu", vec!["a".into(), "b".into()]);
        let token = get_hash(&key, &values(&[("b", "y"), ("a", "x")])).unwrap();
        assert_eq!(token, hash_str("xy"));

        let single = PartitionKey::new("sharded", "treasures", vec!["type".into()]);
        assert_eq!(
            get_hash(&single, &values(&[("type", "gold")])).unwrap(),
            3_966_162_835
        );
    }

    #[test]
    fn test_missing_or_empty_tag_fails() {
        let key = PartitionKey::new("db", "cpu", vec!["a".into(), "b".into()]);
        let partial = values(&[("a", "x"), ("b", "")]);
        assert!(!fulfills_key(&key, &partial));
        match get_hash(&key, &partial) {
            Err(RelayError::PartitionValidation { missing }) => assert_eq!(missing, vec!["b"]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(get_hash(&key, &TagValues::new()).is_err());
    }

    #[test]
    fn test_multiple_values_rejected() {
        let key = PartitionKey::new("db", "cpu", vec!["a".into()]);
        let mut vals = TagValues::new();
        vals.insert("a".into(), vec!["x".into(), "y".into()]);
        assert!(fulfills_key(&key, &vals));
        assert!(matches!(get_hash(&key, &vals), Err(RelayError::BadRequest(_))));
    }

    #[test]
    fn test_key_lookup_prefers_exact() {
        let partitioner = Partitioner::new();
        partitioner.add_keys(vec![
            PartitionKey::new("db", "", vec!["host".into()]),
            PartitionKey::new("db", "cpu", vec!["region".into()]),
        ]);

        let exact = partitioner.get_key_by_measurement("db", "cpu").unwrap();
        assert_eq!(exact.tags, vec!["region"]);
        let wildcard = partitioner.get_key_by_measurement("db", "mem").unwrap();
        assert_eq!(wildcard.id(), "db.");
        assert!(partitioner.get_key_by_measurement("other", "cpu").is_none());

        partitioner.remove_key("db.");
        assert!(partitioner.get_key_by_measurement("db", "mem").is_none());
        assert_eq!(partitioner.len(), 1);
    }
}
