//! FluxRelay Core - cluster coordination for FluxDB-compatible time-series nodes
//!
//! Turns a set of independent TSDB instances into one logical cluster:
//! - Partitioning over a consistent-hash ring with virtual tokens
//! - Replication with hinted recovery of missed writes
//! - Online join/remove with pull-based re-import
//! - Distributed SELECT with partial-result merging
//!
//! # Architecture
//!
//! - **Ring / Resolver**: token → member lookups, synced from the metadata store
//! - **Partitioner**: per-measurement partition keys hashing tag values to tokens
//! - **Write pipeline**: fan-out to replicas, recovery log + hint on failure
//! - **Importer / Rebalance**: token reservation, data pull, delete scheduling
//! - **Query coordinator**: statement routing, base-field rewrite, merge trees
//! - **Auth**: replicated users and privileges

pub mod admin;
pub mod auth;
pub mod backoff;
pub mod hash;
pub mod import;
pub mod influxql;
pub mod launcher;
pub mod membership;
pub mod meta;
pub mod nodes;
pub mod partition;
pub mod query;
pub mod queue;
pub mod rebalance;
pub mod recovery;
pub mod resolver;
pub mod ring;
pub mod tsdb;
pub mod write;

mod error;
mod types;

pub use error::{RelayError, Result};
pub use types::*;

/// FluxRelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Virtual tokens taken by the first member of a cluster
    pub const VIRTUAL_TOKENS: usize = 512;

    /// Token reservations expire unless the joiner finishes first (5h)
    pub const RESERVATION_TTL: Duration = Duration::from_secs(5 * 60 * 60);

    /// Default replication factor when `settings/rf_default` is absent
    pub const DEFAULT_REPLICATION_FACTOR: usize = 1;

    /// TSDB HTTP client timeout
    pub const TSDB_TIMEOUT: Duration = Duration::from_secs(10);

    /// Timeout for a single write fan-out request
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Ping timeout
    pub const PING_TIMEOUT: Duration = Duration::from_secs(4);

    /// Metadata store dial timeout
    pub const META_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Outstanding bytes allowed per backend retry buffer (64MB)
    pub const RETRY_BUFFER_SIZE: usize = 64 * 1024 * 1024;

    /// Largest accepted `/write` body (64MB, one retry buffer)
    pub const MAX_WRITE_BODY: usize = RETRY_BUFFER_SIZE;

    /// Largest recovery log record, a full write body plus framing slack
    pub const MAX_RECOVERY_RECORD: usize = MAX_WRITE_BODY + 1024 * 1024;

    /// Maximum back-off between retries
    pub const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

    /// Initial back-off between retries
    pub const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

    /// Rows fetched per page while importing
    pub const IMPORT_PAGE_SIZE: usize = 10_000;

    /// Lines per write request while importing
    pub const IMPORT_WRITE_BATCH: usize = 5_000;

    /// Periodic auth refresh
    pub const AUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

    /// Recovery driver poll interval
    pub const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Lease TTL for distributed mutexes (kept alive while held)
    pub const LOCK_TTL: Duration = Duration::from_secs(15);

    /// Metadata key base under which clusters are namespaced
    pub const META_BASE: &str = "/fluxrelay";
}
