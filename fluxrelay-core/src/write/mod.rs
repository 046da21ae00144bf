//! Write pipeline
//!
//! Parses a line-protocol body, routes each point to a ring token, fans
//! every token group out to its replicas and buffers writes for replicas
//! that cannot take them.

pub mod backend;

pub use backend::{Backend, BackendConfig, BackendPool};

use crate::hash::database_token;
use crate::meta::SettingsStore;
use crate::partition::{get_hash, missing_tags, Partitioner};
use crate::recovery::RecoveryStore;
use crate::resolver::{Purpose, Resolver};
use crate::tsdb::line_protocol::parse_lines;
use crate::tsdb::WriteRequest;
use crate::{Member, RelayError, Result, Token};
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decode a request body according to its `Content-Encoding`
///
/// A decoded body larger than `limit` bytes is refused.
pub fn decode_body(body: Bytes, content_encoding: Option<&str>, limit: usize) -> Result<Bytes> {
    match content_encoding.map(str::trim) {
        None | Some("") | Some("identity") => Ok(body),
        Some(enc) if enc.eq_ignore_ascii_case("gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(&body[..])
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| RelayError::BadRequest(format!("invalid gzip body: {}", e)))?;
            if out.len() > limit {
                return Err(RelayError::BadRequest(format!(
                    "decoded write body exceeds {} bytes",
                    limit
                )));
            }
            Ok(Bytes::from(out))
        }
        Some(other) => Err(RelayError::BadRequest(format!(
            "unsupported content encoding: {}",
            other
        ))),
    }
}

/// Lines sharing a token and replication factor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGroup {
    pub token: Token,
    pub replication: usize,
    pub lines: Vec<String>,
}

/// Outcome of a fanned-out write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub points: usize,
    pub delivered: usize,
    pub hinted: usize,
    /// Replicas that refused the write while another replica took it
    pub rejected: usize,
}

/// Routes writes to replicas
pub struct WritePipeline {
    partitioner: Arc<Partitioner>,
    resolver: Arc<Resolver>,
    settings: Arc<SettingsStore>,
    backends: Arc<BackendPool>,
    recovery: Arc<RecoveryStore>,
}

impl WritePipeline {
    pub fn new(
        partitioner: Arc<Partitioner>,
        resolver: Arc<Resolver>,
        settings: Arc<SettingsStore>,
        backends: Arc<BackendPool>,
        recovery: Arc<RecoveryStore>,
    ) -> Self {
        Self {
            partitioner,
            resolver,
            settings,
            backends,
            recovery,
        }
    }

    /// Group the lines of a request by ring token
    ///
    /// A point of a partitioned measurement hashes its key tags; any other
    /// point is routed by the database alone.
    pub fn route(&self, request: &WriteRequest) -> Result<Vec<TokenGroup>> {
        let body = std::str::from_utf8(&request.body)
            .map_err(|_| RelayError::BadRequest("write body is not UTF-8".into()))?;
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let lines = parse_lines(body, &request.precision, now)?;

        let mut groups: BTreeMap<(Token, usize), Vec<String>> = BTreeMap::new();
        for line in lines {
            let measurement = &line.point.key.measurement;
            let token = match self
                .partitioner
                .get_key_by_measurement(&request.database, measurement)
            {
                Some(key) => {
                    let values = line.point.key.tag_values();
                    let missing = missing_tags(&key, &values);
                    if !missing.is_empty() {
                        return Err(RelayError::PartitionValidation { missing });
                    }
                    get_hash(&key, &values)?
                }
                None => database_token(&request.database),
            };
            let rf = self.settings.rf(&request.database, measurement);
            groups.entry((token, rf)).or_default().push(line.raw);
        }
        Ok(groups
            .into_iter()
            .map(|((token, replication), lines)| TokenGroup {
                token,
                replication,
                lines,
            })
            .collect())
    }

    /// Write to every replica, buffering for the ones that fail
    ///
    /// A token group succeeds once any replica took it or has it in a
    /// recovery log; a replica refusing it outright is logged and counted.
    /// The refusal is returned only when no replica of the group accepted.
    /// Failing to buffer for an unavailable replica always fails the write.
    pub async fn write(&self, request: &WriteRequest) -> Result<WriteSummary> {
        if request.database.is_empty() {
            return Err(RelayError::BadRequest("database is required".into()));
        }
        let groups = self.route(request)?;
        let mut summary = WriteSummary {
            points: groups.iter().map(|g| g.lines.len()).sum(),
            ..Default::default()
        };

        let mut sends = Vec::new();
        let mut owners = Vec::new();
        for (index, group) in groups.iter().enumerate() {
            let replicas = self
                .resolver
                .find_nodes_by_key_n(group.token, group.replication, Purpose::Write);
            if replicas.is_empty() {
                return Err(RelayError::NoHealthyReplica(format!("token {}", group.token)));
            }
            let mut body = group.lines.join("\n");
            body.push('\n');
            let sub = WriteRequest {
                body: Bytes::from(body),
                ..request.clone()
            };
            for member in replicas {
                debug!(token = group.token, node = %member.name, lines = group.lines.len(), "dispatching write");
                owners.push((index, member.name.clone()));
                sends.push(self.send(member, sub.clone()));
            }
        }

        let mut accepted = vec![false; groups.len()];
        let mut refusals: BTreeMap<usize, RelayError> = BTreeMap::new();
        for ((index, node), outcome) in owners.into_iter().zip(join_all(sends).await) {
            match outcome? {
                Delivery::Delivered => {
                    summary.delivered += 1;
                    accepted[index] = true;
                }
                Delivery::Hinted => {
                    summary.hinted += 1;
                    accepted[index] = true;
                }
                Delivery::Rejected(e) => {
                    warn!(node = %node, token = groups[index].token, error = %e, "replica refused write");
                    refusals.entry(index).or_insert(e);
                }
            }
        }
        for (index, e) in refusals {
            if !accepted[index] {
                return Err(e);
            }
            summary.rejected += 1;
        }
        Ok(summary)
    }

    async fn send(&self, member: Member, request: WriteRequest) -> Result<Delivery> {
        let backend = self.backends.get(&member.location);
        match backend.send(request.clone()).await {
            Ok(()) => Ok(Delivery::Delivered),
            Err(e @ RelayError::BufferFull(_)) => Err(e),
            Err(e) if e.is_retryable() => {
                warn!(node = %member.name, error = %e, "replica unavailable, buffering write");
                self.recovery.put(&member.name, &request).await?;
                Ok(Delivery::Hinted)
            }
            Err(e) => Ok(Delivery::Rejected(e)),
        }
    }
}

enum Delivery {
    Delivered,
    Hinted,
    /// Refused by the replica; buffering would not help
    Rejected(RelayError),
}
