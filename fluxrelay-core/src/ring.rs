//! Partition ring
//!
//! Ordered `token → partition` map with clockwise successor lookup. The ring
//! stores member names only; members are resolved through the node
//! collection on every lookup so cached member state never goes stale.
//! Backed by a lock-free skip list so readers never block the syncer.

use crate::Token;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

/// A ring partition: the token labelling it and the owning member's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub token: Token,
    pub member: String,
}

/// Consistent-hash ring keyed by token
pub struct Ring {
    partitions: SkipMap<Token, Partition>,
}

impl Ring {
    /// Create an empty ring
    pub fn new() -> Self {
        Self {
            partitions: SkipMap::new(),
        }
    }

    /// Assign a token to a member, replacing any previous owner
    pub fn put(&self, token: Token, member: impl Into<String>) {
        self.partitions.insert(
            token,
            Partition {
                token,
                member: member.into(),
            },
        );
    }

    /// Remove a token
    pub fn remove(&self, token: Token) -> Option<Partition> {
        self.partitions.remove(&token).map(|e| e.value().clone())
    }

    /// Remove every token
    pub fn clear(&self) {
        self.partitions.clear();
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Owner of a token, if assigned
    pub fn owner(&self, token: Token) -> Option<String> {
        self.partitions.get(&token).map(|e| e.value().member.clone())
    }

    /// Smallest token >= key, wrapping to the minimum token
    pub fn get(&self, key: Token) -> Option<Partition> {
        self.partitions
            .range(key..)
            .next()
            .or_else(|| self.partitions.front())
            .map(|e| e.value().clone())
    }

    /// Up to `n` distinct partitions walking clockwise from `get(key)`
    pub fn get_multi(&self, key: Token, n: usize) -> Vec<Partition> {
        let start = match self.get(key) {
            Some(p) => p.token,
            None => return Vec::new(),
        };
        self.partitions
            .range(start..)
            .chain(self.partitions.range(..start))
            .take(n)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Up to `n` distinct tokens walking counter-clockwise from `token`,
    /// excluding `token` itself
    pub fn predecessors(&self, token: Token, n: usize) -> Vec<Token> {
        let tokens = self.tokens();
        if tokens.len() < 2 || n == 0 {
            return Vec::new();
        }
        // position of the partition responsible for `token`
        let pos = match tokens.binary_search(&token) {
            Ok(i) => i,
            Err(i) => i % tokens.len(),
        };
        let len = tokens.len();
        (1..len)
            .take(n)
            .map(|step| tokens[(pos + len - step) % len])
            .collect()
    }

    /// Tokens immediately before and after `token` on the ring
    pub fn neighbors(&self, token: Token) -> Option<(Partition, Partition)> {
        let next = self
            .partitions
            .range((Bound::Excluded(token), Bound::Unbounded))
            .next()
            .or_else(|| self.partitions.front())?
            .value()
            .clone();
        let prev_token = *self.predecessors(token, 1).first()?;
        let prev = self.partitions.get(&prev_token)?.value().clone();
        Some((prev, next))
    }

    /// All tokens ascending
    pub fn tokens(&self) -> Vec<Token> {
        self.partitions.iter().map(|e| *e.key()).collect()
    }

    /// Ordered iteration for administrative scans
    pub fn values(&self) -> Vec<Partition> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }

    /// Tokens owned by a member
    pub fn tokens_of(&self, member: &str) -> Vec<Token> {
        self.partitions
            .iter()
            .filter(|e| e.value().member == member)
            .map(|e| *e.key())
            .collect()
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(tokens: &[(Token, &str)]) -> Ring {
        let ring = Ring::new();
        for (t, m) in tokens {
            ring.put(*t, *m);
        }
        ring
    }

    #[test]
    fn test_get_successor_with_wrap() {
        let ring = ring(&[(100, "a"), (200, "b"), (300, "c")]);
        assert_eq!(ring.get(50).unwrap().token, 100);
        assert_eq!(ring.get(100).unwrap().token, 100);
        assert_eq!(ring.get(101).unwrap().token, 200);
        assert_eq!(ring.get(301).unwrap().token, 100);
        assert_eq!(ring.get(u32::MAX).unwrap().member, "a");
    }

    #[test]
    fn test_empty_ring() {
        let ring = Ring::new();
        assert!(ring.get(5).is_none());
        assert!(ring.get_multi(5, 3).is_empty());
        assert!(ring.predecessors(5, 2).is_empty());
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a = ring(&[(300, "c"), (100, "a"), (200, "b")]);
        let b = ring(&[(100, "a"), (200, "b"), (300, "c")]);
        assert_eq!(a.values(), b.values());
        assert_eq!(a.tokens(), vec![100, 200, 300]);
    }

    #[test]
    fn test_get_multi_distinct_tokens() {
        let ring = ring(&[(100, "a"), (200, "a"), (300, "b")]);
        let parts = ring.get_multi(250, 3);
        let tokens: Vec<_> = parts.iter().map(|p| p.token).collect();
        assert_eq!(tokens, vec![300, 100, 200]);

        // never more partitions than exist
        assert_eq!(ring.get_multi(0, 10).len(), 3);
        assert_eq!(ring.get_multi(0, 2).len(), 2);
    }

    #[test]
    fn test_predecessors() {
        let ring = ring(&[(100, "a"), (200, "b"), (300, "c"), (400, "d")]);
        assert_eq!(ring.predecessors(300, 2), vec![200, 100]);
        assert_eq!(ring.predecessors(100, 2), vec![400, 300]);
        assert_eq!(ring.predecessors(100, 10), vec![400, 300, 200]);
    }

    #[test]
    fn test_neighbors_and_owner() {
        let ring = ring(&[(100, "a"), (200, "b"), (300, "c")]);
        let (prev, next) = ring.neighbors(100).unwrap();
        assert_eq!(prev.token, 300);
        assert_eq!(next.token, 200);
        assert_eq!(ring.owner(200).as_deref(), Some("b"));

        ring.put(200, "z");
        assert_eq!(ring.owner(200).as_deref(), Some("z"));
        assert_eq!(ring.remove(200).unwrap().member, "z");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.tokens_of("a"), vec![100]);
    }
}
