//! FluxRelay Server - cluster coordinator in front of a FluxDB-compatible TSDB

mod api;
mod meta;

use clap::Parser;
use fluxrelay_core::config::{DEFAULT_REPLICATION_FACTOR, META_BASE, VIRTUAL_TOKENS};
use fluxrelay_core::launcher::{ClusterConfig, Launcher};
use fluxrelay_core::meta::{self as meta_store, MemoryMetaStore, SharedMetaStore};
use fluxrelay_core::tsdb::{HttpConnector, MemoryCluster, SharedConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Debug, Clone, Parser)]
#[command(name = "fluxrelay", version, about = "Cluster coordinator for FluxDB-compatible TSDB nodes")]
pub struct Args {
    /// Address the HTTP API listens on
    #[arg(long, default_value = "0.0.0.0", env = "FLUXRELAY_CLIENT_ADDR")]
    pub client_addr: String,

    /// Port the HTTP API listens on
    #[arg(long, default_value_t = 7076, env = "FLUXRELAY_CLIENT_PORT")]
    pub client_port: u16,

    /// host:port of the local TSDB, or memory:// for an in-process one
    #[arg(long, default_value = "localhost:8086", env = "FLUXRELAY_DATA")]
    pub data: String,

    /// Metadata endpoints, comma separated: memory:// or the http://host:port
    /// of a member started with --serve-meta. These speak the /meta/v1 HTTP
    /// protocol, not the etcd API; --etcd is accepted as an older spelling.
    #[arg(long, alias = "etcd", default_value = "memory://", env = "FLUXRELAY_META")]
    pub meta: String,

    #[arg(long, default_value = "default", env = "FLUXRELAY_CLUSTER_ID")]
    pub cluster_id: String,

    /// Unique name of this member
    #[arg(long, env = "FLUXRELAY_NODE_NAME")]
    pub node_name: String,

    /// Root of the cluster keyspace in the metadata store
    #[arg(long, default_value = META_BASE)]
    pub meta_prefix: String,

    /// Directory for recovery logs
    #[arg(long, default_value = "recovery")]
    pub recovery_dir: PathBuf,

    /// Cluster default replication factor, written on first start
    #[arg(long, default_value_t = DEFAULT_REPLICATION_FACTOR)]
    pub replication_factor: usize,

    /// Tokens taken by the first member
    #[arg(long, default_value_t = VIRTUAL_TOKENS)]
    pub virtual_tokens: usize,

    /// Check credentials and privileges
    #[arg(long)]
    pub auth_enabled: bool,

    /// Host the metadata store in this process and serve it under /meta/v1
    #[arg(long)]
    pub serve_meta: bool,

    /// trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_name: self.node_name.clone(),
            data_location: self.data.clone(),
            cluster_id: self.cluster_id.clone(),
            meta_prefix: self.meta_prefix.clone(),
            recovery_dir: self.recovery_dir.clone(),
            replication_factor: self.replication_factor.max(1),
            virtual_tokens: self.virtual_tokens.max(1),
            auth_enabled: self.auth_enabled,
        }
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let addr: SocketAddr = format!("{}:{}", args.client_addr, args.client_port).parse()?;
    info!(node = %args.node_name, data = %args.data, meta = %args.meta, "starting FluxRelay {}", fluxrelay_core::VERSION);

    let hosted = args.serve_meta.then(|| Arc::new(MemoryMetaStore::new()));
    let store: SharedMetaStore = match &hosted {
        Some(store) => store.clone() as SharedMetaStore,
        None => meta_store::connect(&args.meta)?,
    };
    let connector: SharedConnector = if args.data.starts_with("memory://") {
        Arc::new(MemoryCluster::new())
    } else {
        Arc::new(HttpConnector::new())
    };

    let launcher = Arc::new(Launcher::start(args.cluster_config(), store, connector).await?);

    let mut app = api::create_router(launcher.clone());
    if let Some(store) = hosted {
        info!("serving metadata store under {}", fluxrelay_core::meta::http::META_PATH);
        app = app.merge(meta::create_router(store));
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "FluxRelay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    launcher.shutdown().await;
    Ok(())
}
