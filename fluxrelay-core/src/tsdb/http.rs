//! HTTP TSDB client (InfluxDB 1.x API)

use super::{QueryResponse, SharedTsdb, Tsdb, TsdbConnector, WriteRequest};
use crate::config::{PING_TIMEOUT, TSDB_TIMEOUT, WRITE_TIMEOUT};
use crate::{RelayError, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// A TSDB reached over HTTP
pub struct HttpTsdb {
    location: String,
    base: String,
    client: reqwest::Client,
}

impl HttpTsdb {
    pub fn new(location: impl Into<String>, client: reqwest::Client) -> Self {
        let location = location.into();
        let base = if location.starts_with("http://") || location.starts_with("https://") {
            location.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", location)
        };
        Self {
            location,
            base,
            client,
        }
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(RelayError::Tsdb {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Tsdb for HttpTsdb {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, request: &WriteRequest) -> Result<()> {
        let mut params = vec![("db", request.database.as_str())];
        if !request.retention_policy.is_empty() {
            params.push(("rp", request.retention_policy.as_str()));
        }
        if !request.precision.is_empty() {
            params.push(("precision", request.precision.as_str()));
        }
        let resp = self
            .client
            .post(format!("{}/write", self.base))
            .query(&params)
            .timeout(WRITE_TIMEOUT)
            .body(request.body.clone())
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn query(&self, database: &str, query: &str, epoch: Option<&str>) -> Result<QueryResponse> {
        let mut params = vec![("q", query)];
        if !database.is_empty() {
            params.push(("db", database));
        }
        if let Some(epoch) = epoch {
            params.push(("epoch", epoch));
        }
        let resp = self
            .client
            .post(format!("{}/query", self.base))
            .form(&params)
            .timeout(TSDB_TIMEOUT)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn ping(&self) -> Result<String> {
        let resp = self
            .client
            .get(format!("{}/ping", self.base))
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        let resp = check(resp).await?;
        Ok(resp
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string())
    }
}

/// Builds [`HttpTsdb`] handles sharing one connection pool
#[derive(Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl TsdbConnector for HttpConnector {
    fn connect(&self, location: &str) -> SharedTsdb {
        std::sync::Arc::new(HttpTsdb::new(location, self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let client = reqwest::Client::new();
        assert_eq!(HttpTsdb::new("localhost:8086", client.clone()).base, "http://localhost:8086");
        assert_eq!(HttpTsdb::new("https://tsdb:8086/", client).base, "https://tsdb:8086");
    }

    #[tokio::test]
    async fn test_unreachable_is_retryable() {
        let tsdb = HttpTsdb::new("127.0.0.1:1", reqwest::Client::new());
        let err = tsdb.ping().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
