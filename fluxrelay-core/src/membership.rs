//! Membership events
//!
//! Translates member join/leave/update notifications into ring updates.
//! Each notification carries the member's metadata blob; updates are
//! reduced to a token delta and handed to a [`TokenDelegate`].

use crate::resolver::Resolver;
use crate::{Member, NodeStatus, RelayError, Result, Token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Metadata a member advertises to its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberMeta {
    pub tokens: BTreeSet<Token>,
    pub status: NodeStatus,
    pub location: String,
}

impl MemberMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(|e| RelayError::BadRequest(format!("invalid member metadata: {}", e)))
    }
}

impl From<&Member> for MemberMeta {
    fn from(m: &Member) -> Self {
        Self {
            tokens: m.tokens.clone(),
            status: m.status,
            location: m.location.clone(),
        }
    }
}

/// A membership notification
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Join { name: String, meta: Vec<u8> },
    Update { name: String, meta: Vec<u8> },
    Leave { name: String },
}

/// Receiver of token changes derived from membership updates
pub trait TokenDelegate: Send + Sync {
    fn tokens_added(&self, member: &str, tokens: &[Token]);
    fn tokens_removed(&self, member: &str, tokens: &[Token]);
}

impl TokenDelegate for Resolver {
    fn tokens_added(&self, member: &str, tokens: &[Token]) {
        for token in tokens {
            self.add_token(*token, member);
        }
    }

    fn tokens_removed(&self, member: &str, tokens: &[Token]) {
        for token in tokens {
            // a newer owner may already have claimed it
            if self.ring().owner(*token).as_deref() == Some(member) {
                self.remove_token(*token);
            }
        }
    }
}

/// Tracks the last metadata seen per member and applies deltas
pub struct Membership {
    delegate: Arc<dyn TokenDelegate>,
    known: parking_lot::Mutex<HashMap<String, MemberMeta>>,
}

impl Membership {
    pub fn new(delegate: Arc<dyn TokenDelegate>) -> Self {
        Self {
            delegate,
            known: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Apply one notification
    pub fn handle(&self, event: MembershipEvent) -> Result<()> {
        match event {
            MembershipEvent::Join { name, meta } => {
                let meta = MemberMeta::decode(&meta)?;
                info!(member = %name, tokens = meta.tokens.len(), status = %meta.status, "member joined");
                let tokens: Vec<Token> = meta.tokens.iter().copied().collect();
                self.delegate.tokens_added(&name, &tokens);
                self.known.lock().insert(name, meta);
            }
            MembershipEvent::Update { name, meta } => {
                let meta = MemberMeta::decode(&meta)?;
                let previous = self.known.lock().insert(name.clone(), meta.clone());
                let old = previous.map(|m| m.tokens).unwrap_or_default();
                let (added, removed) = token_delta(&old, &meta.tokens);
                if !added.is_empty() || !removed.is_empty() {
                    debug!(member = %name, added = added.len(), removed = removed.len(), "member tokens changed");
                }
                self.delegate.tokens_added(&name, &added);
                self.delegate.tokens_removed(&name, &removed);
            }
            MembershipEvent::Leave { name } => {
                let previous = self.known.lock().remove(&name);
                if let Some(meta) = previous {
                    info!(member = %name, "member left");
                    let tokens: Vec<Token> = meta.tokens.into_iter().collect();
                    self.delegate.tokens_removed(&name, &tokens);
                }
            }
        }
        Ok(())
    }

    /// Translate a node-collection change into a notification
    pub fn event_for(&self, name: &str, member: Option<&Member>) -> Result<MembershipEvent> {
        let known = self.known.lock().contains_key(name);
        Ok(match member {
            None => MembershipEvent::Leave { name: name.to_string() },
            Some(m) if known => MembershipEvent::Update {
                name: name.to_string(),
                meta: MemberMeta::from(m).encode()?,
            },
            Some(m) => MembershipEvent::Join {
                name: name.to_string(),
                meta: MemberMeta::from(m).encode()?,
            },
        })
    }
}

/// Tokens added and removed going from `old` to `new`
pub fn token_delta(old: &BTreeSet<Token>, new: &BTreeSet<Token>) -> (Vec<Token>, Vec<Token>) {
    (
        new.difference(old).copied().collect(),
        old.difference(new).copied().collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Keyspace, MemoryMetaStore, NodeStore, SharedMetaStore};
    use crate::nodes::NodeCollection;

    fn resolver() -> Arc<Resolver> {
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let nodes = Arc::new(NodeCollection::new(NodeStore::new(store, Keyspace::new("/f", "t"))));
        Arc::new(Resolver::new(nodes, 1))
    }

    fn meta(tokens: &[Token]) -> Vec<u8> {
        MemberMeta {
            tokens: tokens.iter().copied().collect(),
            status: NodeStatus::Up,
            location: "h:1".into(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_token_delta() {
        let old: BTreeSet<Token> = [1, 2, 3].into_iter().collect();
        let new: BTreeSet<Token> = [2, 3, 4].into_iter().collect();
        assert_eq!(token_delta(&old, &new), (vec![4], vec![1]));
    }

    #[test]
    fn test_join_update_leave() {
        let resolver = resolver();
        let membership = Membership::new(resolver.clone());

        membership
            .handle(MembershipEvent::Join { name: "a".into(), meta: meta(&[10, 20]) })
            .unwrap();
        assert_eq!(resolver.ring().tokens(), vec![10, 20]);

        membership
            .handle(MembershipEvent::Update { name: "a".into(), meta: meta(&[20, 30]) })
            .unwrap();
        assert_eq!(resolver.ring().tokens(), vec![20, 30]);

        // token 30 moved to b before a's leave arrives
        resolver.add_token(30, "b");
        membership.handle(MembershipEvent::Leave { name: "a".into() }).unwrap();
        assert_eq!(resolver.ring().tokens(), vec![30]);
        assert_eq!(resolver.ring().owner(30).as_deref(), Some("b"));
    }

    #[test]
    fn test_bad_blob_rejected() {
        let membership = Membership::new(resolver());
        let event = MembershipEvent::Join { name: "a".into(), meta: b"nope".to_vec() };
        assert!(membership.handle(event).is_err());
    }

    #[test]
    fn test_event_for() {
        let membership = Membership::new(resolver());
        let member = Member::new("a", "h:1");
        assert!(matches!(
            membership.event_for("a", Some(&member)).unwrap(),
            MembershipEvent::Join { .. }
        ));
        membership.handle(membership.event_for("a", Some(&member)).unwrap()).unwrap();
        assert!(matches!(
            membership.event_for("a", Some(&member)).unwrap(),
            MembershipEvent::Update { .. }
        ));
        assert!(matches!(
            membership.event_for("a", None).unwrap(),
            MembershipEvent::Leave { .. }
        ));
    }
}
