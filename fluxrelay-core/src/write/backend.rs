//! Per-location write backends
//!
//! Every data location gets one worker task fed by a channel, so writes
//! reach a replica in the order the coordinator accepted them. Requests
//! waiting in the channel or in back-off count against a bounded retry
//! buffer; once it is full new writes are refused with `BufferFull`.

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::RETRY_BUFFER_SIZE;
use crate::tsdb::{SharedConnector, SharedTsdb, WriteRequest};
use crate::{RelayError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Backend tuning
#[derive(Debug, Clone, Copy)]
pub struct BackendConfig {
    /// Bytes of request bodies allowed in flight per location
    pub buffer_size: usize,
    /// Extra attempts for retryable failures before giving up
    pub max_retries: usize,
    pub backoff: BackoffConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            buffer_size: RETRY_BUFFER_SIZE,
            max_retries: 2,
            backoff: BackoffConfig::default(),
        }
    }
}

struct Job {
    request: WriteRequest,
    done: oneshot::Sender<Result<()>>,
}

/// Ordered writer for one data location
pub struct Backend {
    location: String,
    tx: mpsc::UnboundedSender<Job>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
}

impl Backend {
    /// Start the worker for `tsdb`
    pub fn spawn(tsdb: SharedTsdb, config: BackendConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let location = tsdb.location().to_string();
        tokio::spawn(run_worker(tsdb, rx, buffered.clone(), config));
        Self {
            location,
            tx,
            buffered,
            capacity: config.buffer_size,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn admit(&self, size: usize) -> Result<()> {
        self.buffered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current.checked_add(size)?;
                (next <= self.capacity || current == 0).then_some(next)
            })
            .map(|_| ())
            .map_err(|_| RelayError::BufferFull(self.location.clone()))
    }

    /// Queue a write and wait for its outcome
    pub async fn send(&self, request: WriteRequest) -> Result<()> {
        let size = request.body.len();
        self.admit(size)?;
        let (done, outcome) = oneshot::channel();
        if self.tx.send(Job { request, done }).is_err() {
            self.buffered.fetch_sub(size, Ordering::SeqCst);
            return Err(RelayError::Internal(format!(
                "write backend for {} stopped",
                self.location
            )));
        }
        outcome.await.map_err(|_| {
            RelayError::Internal(format!("write backend for {} dropped a request", self.location))
        })?
    }
}

async fn run_worker(
    tsdb: SharedTsdb,
    mut rx: mpsc::UnboundedReceiver<Job>,
    buffered: Arc<AtomicUsize>,
    config: BackendConfig,
) {
    let mut backoff = Backoff::new(config.backoff);
    while let Some(job) = rx.recv().await {
        let size = job.request.body.len();
        let mut attempt = 0;
        let result = loop {
            match tsdb.write(&job.request).await {
                Ok(()) => {
                    backoff.reset();
                    break Ok(());
                }
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    attempt += 1;
                    let delay = backoff.next_delay();
                    debug!(location = %tsdb.location(), error = %e, attempt, "write failed, backing off {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(location = %tsdb.location(), error = %e, "write failed");
                    break Err(e);
                }
            }
        };
        buffered.fetch_sub(size, Ordering::SeqCst);
        let _ = job.done.send(result);
    }
}

/// Lazily created backends, one per location
pub struct BackendPool {
    connector: SharedConnector,
    config: BackendConfig,
    backends: Mutex<HashMap<String, Arc<Backend>>>,
}

impl BackendPool {
    pub fn new(connector: SharedConnector, config: BackendConfig) -> Self {
        Self {
            connector,
            config,
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, location: &str) -> Arc<Backend> {
        self.backends
            .lock()
            .entry(location.to_string())
            .or_insert_with(|| {
                Arc::new(Backend::spawn(self.connector.connect(location), self.config))
            })
            .clone()
    }
}
