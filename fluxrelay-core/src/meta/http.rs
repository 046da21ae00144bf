//! HTTP metadata store client
//!
//! Talks to the `/meta/v1` service exposed by a node started with
//! `--serve-meta`. Watches are long polls by revision; a poller task per
//! watch forwards events until the receiving side is dropped, or closes the
//! stream when the service no longer holds the events it missed.

use super::{KeyValue, LeaseId, MetaStore, WatchEvent, WatchStream};
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::META_DIAL_TIMEOUT;
use crate::{RelayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Long-poll window requested by watchers
pub const WATCH_POLL: Duration = Duration::from_secs(10);

/// Request path prefix of the metadata service
pub const META_PATH: &str = "/meta/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixRequest {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    #[serde(default)]
    pub id: LeaseId,
    #[serde(default)]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub prefix: String,
    pub after: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaResponse {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub lease: LeaseId,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub events: Vec<WatchEvent>,
    /// Set when the watch fell behind the retained event log
    #[serde(default)]
    pub compacted: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Metadata store reached over HTTP
pub struct HttpMetaStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
    /// Index of the endpoint that last answered
    current: Mutex<usize>,
}

impl HttpMetaStore {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(RelayError::BadRequest("no metadata endpoints given".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(META_DIAL_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current: Mutex::new(0),
        })
    }

    async fn call<B: Serialize + Sync>(&self, op: &str, body: &B) -> Result<MetaResponse> {
        let start = *self.current.lock();
        let mut last_err = None;
        for i in 0..self.endpoints.len() {
            let idx = (start + i) % self.endpoints.len();
            let url = format!("{}{}/{}", self.endpoints[idx], META_PATH, op);
            match self.client.post(&url).json(body).send().await {
                Ok(resp) => {
                    *self.current.lock() = idx;
                    return decode(resp).await;
                }
                Err(e) => {
                    debug!(endpoint = %self.endpoints[idx], error = %e, "metadata endpoint failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(RelayError::from)
            .unwrap_or_else(|| RelayError::Meta("no endpoint answered".into())))
    }
}

async fn decode(resp: reqwest::Response) -> Result<MetaResponse> {
    let status = resp.status();
    let body: MetaResponse = resp.json().await?;
    if let Some(err) = body.error {
        return Err(RelayError::Meta(err));
    }
    if !status.is_success() {
        return Err(RelayError::Meta(format!("metadata service answered {}", status)));
    }
    Ok(body)
}

#[async_trait]
impl MetaStore for HttpMetaStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self.call("get", &KeyRequest { key: key.into() }).await?;
        Ok(resp.value)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self
            .call("range", &PrefixRequest { prefix: prefix.into() })
            .await?;
        Ok(resp.kvs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let req = PutRequest {
            key: key.into(),
            value: value.into(),
            lease,
        };
        self.call("put", &req).await.map(|_| ())
    }

    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool> {
        let req = PutRequest {
            key: key.into(),
            value: value.into(),
            lease,
        };
        Ok(self.call("create", &req).await?.ok)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.call("delete", &KeyRequest { key: key.into() }).await?.ok)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let resp = self
            .call("delete_prefix", &PrefixRequest { prefix: prefix.into() })
            .await?;
        Ok(resp.count)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let mut after = self.revision().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = HttpMetaStore {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            current: Mutex::new(*self.current.lock()),
        };
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(BackoffConfig {
                init: Duration::from_millis(100),
                max: Duration::from_secs(5),
                base: 2.0,
            });
            while !tx.is_closed() {
                let req = WatchRequest {
                    prefix: prefix.clone(),
                    after,
                    timeout_ms: WATCH_POLL.as_millis() as u64,
                };
                match poller.call("watch", &req).await {
                    Ok(resp) => {
                        backoff.reset();
                        if resp.compacted {
                            // events were lost; closing makes every watcher resnapshot
                            warn!(prefix = %prefix, after, "watch fell behind the event log");
                            return;
                        }
                        for event in resp.events {
                            after = after.max(event.revision);
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        after = after.max(resp.revision);
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(prefix = %prefix, error = %e, retry_in = ?delay, "watch poll failed");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let req = LeaseRequest {
            id: 0,
            ttl_ms: ttl.as_millis() as u64,
        };
        Ok(self.call("lease/grant", &req).await?.lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let req = LeaseRequest { id: lease, ttl_ms: 0 };
        self.call("lease/keepalive", &req).await.map(|_| ())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let req = LeaseRequest { id: lease, ttl_ms: 0 };
        self.call("lease/revoke", &req).await.map(|_| ())
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.call("revision", &serde_json::json!({})).await?.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_defaults() {
        let resp: MetaResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(resp.ok);
        assert!(resp.kvs.is_empty());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_requires_endpoint() {
        assert!(HttpMetaStore::new(Vec::new()).is_err());
    }
}
