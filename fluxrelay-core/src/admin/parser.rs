//! Keyword trie for the cluster administration statements
//!
//! Leading keywords walk the trie; the deepest node carrying a handler
//! parses the remainder. Input that does not reach a handler is not an
//! admin statement and is left to the InfluxQL parser.

use super::AdminStatement;
use crate::influxql::lexer::{Lexer, Spanned, Token};
use crate::{RelayError, Result};
use std::collections::BTreeMap;
use std::sync::OnceLock;

type Handler = fn(&mut Cursor) -> Result<AdminStatement>;

#[derive(Default)]
struct TrieNode {
    children: BTreeMap<&'static str, TrieNode>,
    handler: Option<Handler>,
}

impl TrieNode {
    fn insert(&mut self, path: &[&'static str], handler: Handler) {
        let mut node = self;
        for keyword in path {
            node = node.children.entry(keyword).or_default();
        }
        node.handler = Some(handler);
    }
}

fn trie() -> &'static TrieNode {
    static TRIE: OnceLock<TrieNode> = OnceLock::new();
    TRIE.get_or_init(|| {
        let mut root = TrieNode::default();
        root.insert(&["SHOW", "PARTITION", "KEYS"], show_partition_keys);
        root.insert(&["CREATE", "PARTITION", "KEY"], create_partition_key);
        root.insert(&["DROP", "PARTITION", "KEY"], drop_partition_key);
        root.insert(&["SHOW", "NODES"], |_| Ok(AdminStatement::ShowNodes));
        root.insert(&["REMOVE", "NODE"], remove_node);
        root.insert(&["SET", "REPLICATION", "FACTOR"], set_replication_factor);
        root
    })
}

/// Parse `input` as an admin statement
///
/// `None` when the leading keywords do not name one.
pub fn parse_admin(input: &str) -> Option<Result<AdminStatement>> {
    let tokens = match Lexer::new(input).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return None,
    };
    let mut cursor = Cursor { tokens, pos: 0 };

    let mut node = trie();
    let mut matched: Option<(Handler, usize)> = None;
    while let Some(Token::Ident(word)) = cursor.peek() {
        let Some(child) = node.children.get(word.to_ascii_uppercase().as_str()) else {
            break;
        };
        cursor.pos += 1;
        node = child;
        if let Some(handler) = node.handler {
            matched = Some((handler, cursor.pos));
        }
    }

    let (handler, pos) = matched?;
    cursor.pos = pos;
    Some(handler(&mut cursor).and_then(|statement| {
        cursor.finish()?;
        Ok(statement)
    }))
}

struct Cursor {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn next_if(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, kw: &str) -> bool {
        if self.peek().map(|t| t.is_keyword(kw)).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(kw))
        }
    }

    fn unexpected(&self, expected: &str) -> RelayError {
        match self.peek() {
            Some(t) => RelayError::Parse(format!("found {}, expected {}", t, expected)),
            None => RelayError::Parse(format!("unexpected end of statement, expected {}", expected)),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(s)) | Some(Token::QuotedIdent(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    /// `db[.measurement]`
    fn target(&mut self) -> Result<(String, String)> {
        let database = self.ident()?;
        let measurement = if self.next_if(&Token::Dot) {
            self.ident()?
        } else {
            String::new()
        };
        Ok((database, measurement))
    }

    /// `tag[.tag]*`, commas accepted as separators too
    fn tags(&mut self) -> Result<Vec<String>> {
        let mut tags = vec![self.ident()?];
        while self.next_if(&Token::Dot) || self.next_if(&Token::Comma) {
            tags.push(self.ident()?);
        }
        Ok(tags)
    }

    fn finish(&mut self) -> Result<()> {
        while self.next_if(&Token::Semicolon) {}
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.unexpected("end of statement")),
        }
    }
}

fn show_partition_keys(c: &mut Cursor) -> Result<AdminStatement> {
    let database = if c.keyword("ON") { Some(c.ident()?) } else { None };
    Ok(AdminStatement::ShowPartitionKeys { database })
}

fn create_partition_key(c: &mut Cursor) -> Result<AdminStatement> {
    let (tags, (database, measurement)) = if c.keyword("ON") {
        let target = c.target()?;
        c.expect_keyword("WITH")?;
        (c.tags()?, target)
    } else {
        let tags = c.tags()?;
        c.expect_keyword("ON")?;
        (tags, c.target()?)
    };
    Ok(AdminStatement::CreatePartitionKey {
        database,
        measurement,
        tags,
    })
}

fn drop_partition_key(c: &mut Cursor) -> Result<AdminStatement> {
    c.expect_keyword("ON")?;
    let (database, measurement) = c.target()?;
    Ok(AdminStatement::DropPartitionKey {
        database,
        measurement,
    })
}

fn remove_node(c: &mut Cursor) -> Result<AdminStatement> {
    Ok(AdminStatement::RemoveNode { name: c.ident()? })
}

fn set_replication_factor(c: &mut Cursor) -> Result<AdminStatement> {
    let factor = match c.next() {
        Some(Token::Number(n)) => n
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| RelayError::Parse(format!("invalid replication factor: {}", n)))?,
        other => {
            return Err(RelayError::Parse(format!(
                "expected replication factor, found {}",
                other.map(|t| t.to_string()).unwrap_or_else(|| "end of statement".into())
            )))
        }
    };
    let target = if c.keyword("ON") { Some(c.target()?) } else { None };
    Ok(AdminStatement::SetReplicationFactor { factor, target })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<AdminStatement> {
        parse_admin(input).expect("admin statement")
    }

    #[test]
    fn test_partition_key_statements() {
        let expected = AdminStatement::CreatePartitionKey {
            database: "test_db".into(),
            measurement: String::new(),
            tags: vec!["server_id".into()],
        };
        assert_eq!(parse("CREATE PARTITION KEY server_id ON test_db").unwrap(), expected);
        assert_eq!(parse("create partition key on test_db with server_id").unwrap(), expected);

        assert_eq!(
            parse("CREATE PARTITION KEY region.host ON db.\"cpu load\"").unwrap(),
            AdminStatement::CreatePartitionKey {
                database: "db".into(),
                measurement: "cpu load".into(),
                tags: vec!["region".into(), "host".into()],
            }
        );
        assert_eq!(
            parse("DROP PARTITION KEY ON db.cpu").unwrap(),
            AdminStatement::DropPartitionKey {
                database: "db".into(),
                measurement: "cpu".into()
            }
        );
        assert_eq!(
            parse("SHOW PARTITION KEYS ON db;").unwrap(),
            AdminStatement::ShowPartitionKeys {
                database: Some("db".into())
            }
        );
    }

    #[test]
    fn test_node_and_replication_statements() {
        assert_eq!(parse("SHOW NODES").unwrap(), AdminStatement::ShowNodes);
        assert_eq!(
            parse("REMOVE NODE n2").unwrap(),
            AdminStatement::RemoveNode { name: "n2".into() }
        );
        assert_eq!(
            parse("SET REPLICATION FACTOR 3").unwrap(),
            AdminStatement::SetReplicationFactor {
                factor: 3,
                target: None
            }
        );
        assert_eq!(
            parse("SET REPLICATION FACTOR 2 ON db.cpu").unwrap(),
            AdminStatement::SetReplicationFactor {
                factor: 2,
                target: Some(("db".into(), "cpu".into()))
            }
        );
    }

    #[test]
    fn test_not_admin() {
        assert!(parse_admin("SHOW DATABASES").is_none());
        assert!(parse_admin("SELECT * FROM cpu").is_none());
        assert!(parse_admin("DROP DATABASE db").is_none());
    }

    #[test]
    fn test_errors() {
        assert!(parse("CREATE PARTITION KEY ON db").is_err());
        assert!(parse("SET REPLICATION FACTOR 0").is_err());
        assert!(parse("SHOW NODES extra").is_err());
        assert!(parse("REMOVE NODE").is_err());
    }
}
