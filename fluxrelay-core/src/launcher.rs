//! Node launcher
//!
//! Owns one member's state (ring, collections, auth, pipelines) and the
//! background loops keeping it in step with the metadata store.

use crate::admin::{parse_admin, AdminExecutor};
use crate::auth::{AuthService, Privilege, User};
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::{
    DEFAULT_REPLICATION_FACTOR, IMPORT_PAGE_SIZE, IMPORT_WRITE_BATCH, META_BASE, VIRTUAL_TOKENS,
};
use crate::import::{DeleteTask, DeleteWorker, ImportTask, Importer, ReassignHook, ReliableImporter};
use crate::meta::{
    HintStore, Keyspace, MetaStore, NodeStore, PartitionKeyStore, SettingsStore, SharedMetaStore,
    TokenStore,
};
use crate::nodes::NodeCollection;
use crate::partition::Partitioner;
use crate::query::{QueryCoordinator, QueryRequest};
use crate::queue::{WorkQueue, WorkType};
use crate::rebalance::{JoinReport, Rebalancer};
use crate::recovery::{RecoveryDriver, RecoveryStore};
use crate::resolver::{Resolver, ResolverSyncer};
use crate::tsdb::{QueryResponse, SharedConnector, StatementResult, WriteRequest};
use crate::write::{BackendConfig, BackendPool, WritePipeline, WriteSummary};
use crate::{Member, NodeStatus, RelayError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runtime configuration of one member
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique member name
    pub node_name: String,
    /// host:port of the member's TSDB
    pub data_location: String,
    pub cluster_id: String,
    /// Root of the cluster keyspace in the metadata store
    pub meta_prefix: String,
    pub recovery_dir: PathBuf,
    /// Cluster default written on first start, also the resolver default
    pub replication_factor: usize,
    pub virtual_tokens: usize,
    pub auth_enabled: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            data_location: "localhost:8086".to_string(),
            cluster_id: "default".to_string(),
            meta_prefix: META_BASE.to_string(),
            recovery_dir: PathBuf::from("./recovery"),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            virtual_tokens: VIRTUAL_TOKENS,
            auth_enabled: false,
        }
    }
}

/// A running cluster member
pub struct Launcher {
    config: ClusterConfig,
    connector: SharedConnector,
    nodes: Arc<NodeCollection>,
    resolver: Arc<Resolver>,
    partitioner: Arc<Partitioner>,
    settings: Arc<SettingsStore>,
    auth: Arc<AuthService>,
    writes: WritePipeline,
    queries: QueryCoordinator,
    admin: AdminExecutor,
    deletes: Arc<WorkQueue<DeleteTask>>,
    join: JoinReport,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Launcher {
    /// Register the member, join the ring and start the background loops
    pub async fn start(config: ClusterConfig, store: SharedMetaStore, connector: SharedConnector) -> Result<Self> {
        let name = config.node_name.clone();
        let keys = Keyspace::new(&config.meta_prefix, &config.cluster_id);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        info!(node = %name, location = %config.data_location, cluster = %config.cluster_id, "starting member");

        let nodes = Arc::new(NodeCollection::new(NodeStore::new(store.clone(), keys.clone())));
        nodes.load().await?;
        let member = match nodes.get(&name) {
            Some(mut existing) => {
                if existing.status == NodeStatus::Removed {
                    return Err(RelayError::Conflict(format!("node {} was removed from the cluster", name)));
                }
                existing.location = config.data_location.clone();
                existing
            }
            None => Member::new(&name, &config.data_location),
        };
        nodes.persist(&member).await?;

        let settings = Arc::new(SettingsStore::new(store.clone(), keys.clone()));
        settings.load().await?;
        if store.get(&keys.setting("rf_default")).await?.is_none() {
            settings.set_rf_default(config.replication_factor).await?;
        }

        let tokens = Arc::new(TokenStore::new(store.clone(), keys.clone()));
        let resolver = Arc::new(
            Resolver::new(nodes.clone(), config.replication_factor).with_settings(settings.clone()),
        );
        let weak: Weak<Resolver> = Arc::downgrade(&resolver);
        nodes.on_remove(move |m| {
            if let Some(resolver) = weak.upgrade() {
                info!(member = %m.name, "member deleted, dropping its tokens");
                resolver.remove_all_tokens(&m.name);
            }
        });
        ResolverSyncer::new(resolver.clone(), tokens.clone()).snapshot().await?;

        let partition_keys = PartitionKeyStore::new(store.clone(), keys.clone());
        let partitioner = Arc::new(Partitioner::new());
        partitioner.replace_all(partition_keys.get_all().await?);

        let auth = Arc::new(AuthService::new(store.clone(), keys.clone()));
        auth.load().await?;

        let hints = HintStore::new(store.clone(), keys.clone());
        let recovery = Arc::new(RecoveryStore::open(&config.recovery_dir, &name, hints.clone())?);
        let backends = Arc::new(BackendPool::new(connector.clone(), BackendConfig::default()));
        let writes = WritePipeline::new(
            partitioner.clone(),
            resolver.clone(),
            settings.clone(),
            backends,
            recovery.clone(),
        );
        let queries = QueryCoordinator::new(
            partitioner.clone(),
            resolver.clone(),
            settings.clone(),
            connector.clone(),
            auth.clone(),
        )
        .with_auth_enabled(config.auth_enabled);

        let importer = Arc::new(
            Importer::new(resolver.clone(), partitioner.clone(), connector.clone())
                .with_batching(IMPORT_PAGE_SIZE, IMPORT_WRITE_BATCH),
        );
        let imports = Arc::new(WorkQueue::<ImportTask>::new(
            store.clone(),
            keys.clone(),
            WorkType::Import,
            &name,
        ));
        let deletes = Arc::new(WorkQueue::<DeleteTask>::new(
            store.clone(),
            keys.clone(),
            WorkType::DeleteByToken,
            &name,
        ));
        let rebalancer = Arc::new(
            Rebalancer::new(
                &name,
                store.clone(),
                keys.clone(),
                nodes.clone(),
                tokens.clone(),
                resolver.clone(),
                importer.clone(),
                imports.clone(),
                deletes.clone(),
            )
            .with_virtual_tokens(config.virtual_tokens),
        );
        let admin = AdminExecutor::new(
            partition_keys.clone(),
            partitioner.clone(),
            nodes.clone(),
            settings.clone(),
        )
        .with_rebalancer(rebalancer.clone())
        .with_auth_enabled(config.auth_enabled);

        {
            let nodes = nodes.clone();
            spawn_supervised(&mut tasks, "node sync", &cancel, move |c| nodes.clone().sync(c));
        }
        {
            let (resolver, tokens) = (resolver.clone(), tokens.clone());
            spawn_supervised(&mut tasks, "resolver sync", &cancel, move |c| {
                ResolverSyncer::new(resolver.clone(), tokens.clone()).run(c)
            });
        }
        {
            let partitioner = partitioner.clone();
            spawn_supervised(&mut tasks, "partition key sync", &cancel, move |c| {
                sync_partition_keys(partition_keys.clone(), partitioner.clone(), c)
            });
        }
        {
            let settings = settings.clone();
            spawn_supervised(&mut tasks, "settings sync", &cancel, move |c| {
                sync_settings(settings.clone(), c)
            });
        }
        {
            let auth = auth.clone();
            spawn_supervised(&mut tasks, "auth refresh", &cancel, move |c| auth.clone().run(c));
        }

        let join = rebalancer.join().await?;
        info!(node = %name, tokens = join.tokens.len(), first = join.first, "member joined");

        let driver = Arc::new(RecoveryDriver::new(nodes.clone(), hints, recovery, connector.clone()));
        {
            let driver = driver.clone();
            spawn_supervised(&mut tasks, "recovery holder", &cancel, move |c| driver.clone().run(c));
        }
        {
            let cancel = cancel.clone();
            spawn(&mut tasks, "recovery target", async move {
                driver.recover(&cancel).await.map(|_| ())
            });
        }

        let hook = Arc::new(ReassignHook::new(tokens, resolver.clone(), &name));
        let reliable = Arc::new(ReliableImporter::new(
            &name,
            importer.clone(),
            imports,
            nodes.clone(),
            hook,
        ));
        spawn_supervised(&mut tasks, "import worker", &cancel, move |c| reliable.clone().run(c));
        let delete_worker = Arc::new(DeleteWorker::new(&name, importer, deletes.clone(), nodes.clone()));
        spawn_supervised(&mut tasks, "delete worker", &cancel, move |c| delete_worker.clone().run(c));

        Ok(Self {
            config,
            connector,
            nodes,
            resolver,
            partitioner,
            settings,
            auth,
            writes,
            queries,
            admin,
            deletes,
            join,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeCollection> {
        &self.nodes
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        &self.partitioner
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    /// Outcome of the join performed at start
    pub fn join_report(&self) -> &JoinReport {
        &self.join
    }

    /// Delete tasks still queued for this member
    pub async fn pending_deletes(&self) -> Result<usize> {
        Ok(self.deletes.pending(self.name()).await?.len())
    }

    /// Check `user` and `password` when auth is enabled
    ///
    /// `None` with auth disabled.
    pub fn authenticate(&self, credentials: Option<(&str, &str)>) -> Result<Option<User>> {
        if !self.config.auth_enabled {
            return Ok(None);
        }
        match credentials {
            Some((user, password)) => self.auth.authenticate(user, password).map(Some),
            None => Ok(None),
        }
    }

    pub async fn write(&self, request: &WriteRequest, user: Option<&User>) -> Result<WriteSummary> {
        if self.config.auth_enabled {
            let user = user.ok_or_else(|| RelayError::Unauthorized("no user provided".into()))?;
            if !AuthService::authorize(user, &request.database, Privilege::Write) {
                return Err(RelayError::Forbidden(format!(
                    "{} not authorized to write to {}",
                    user.name, request.database
                )));
            }
        }
        self.writes.write(request).await
    }

    /// Admin statements first, InfluxQL otherwise
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        if let Some(statement) = parse_admin(&request.query) {
            let series = self.admin.execute(&statement?, request.user.as_ref()).await?;
            return Ok(QueryResponse::from_results(vec![StatementResult::ok(0, series)]));
        }
        self.queries.query(request).await
    }

    /// Version string of the local TSDB
    pub async fn ping(&self) -> Result<String> {
        self.connector.connect(&self.config.data_location).ping().await
    }

    /// Stop the background loops and wait for them
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_name, "shutting down");
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
    }
}

/// Spawn a loop that runs until `cancel` fires, see [`supervise`]
fn spawn_supervised<M, F>(tasks: &mut Vec<JoinHandle<()>>, name: &'static str, cancel: &CancellationToken, make: M)
where
    M: FnMut(CancellationToken) -> F + Send + 'static,
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.push(tokio::spawn(supervise(name, cancel.clone(), BackoffConfig::default(), make)));
}

/// Run the loop built by `make` until `cancel` fires
///
/// A loop that fails, or ends while not cancelled, is rebuilt after a
/// back-off; every rebuild takes a fresh snapshot before tailing again.
async fn supervise<M, F>(name: &'static str, cancel: CancellationToken, backoff: BackoffConfig, mut make: M)
where
    M: FnMut(CancellationToken) -> F,
    F: Future<Output = Result<()>>,
{
    let mut delays = Backoff::new(backoff);
    loop {
        let started = Instant::now();
        let result = make(cancel.clone()).await;
        if cancel.is_cancelled() {
            return;
        }
        if started.elapsed() >= backoff.max {
            delays.reset();
        }
        let delay = delays.next_delay();
        match result {
            Ok(()) => warn!(task = name, retry_in = ?delay, "background task stopped; restarting"),
            Err(e) => error!(task = name, error = %e, retry_in = ?delay, "background task failed; restarting"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn spawn<F>(tasks: &mut Vec<JoinHandle<()>>, name: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.push(tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(task = name, error = %e, "background task failed");
        }
    }));
}

async fn sync_partition_keys(
    store: PartitionKeyStore,
    partitioner: Arc<Partitioner>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut watch = store.watch().await?;
    partitioner.replace_all(store.get_all().await?);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = watch.recv() => {
                let Some(event) = event else {
                    watch = store.watch().await?;
                    partitioner.replace_all(store.get_all().await?);
                    continue;
                };
                match store.decode(&event) {
                    Ok((_, Some(key))) => partitioner.add_key(key),
                    Ok((id, None)) => {
                        partitioner.remove_key(&id);
                    }
                    Err(e) => warn!(error = %e, "skipping undecodable partition key"),
                }
            }
        }
    }
}

async fn sync_settings(settings: Arc<SettingsStore>, cancel: CancellationToken) -> Result<()> {
    let mut watch = settings.watch().await?;
    settings.load().await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = watch.recv() => {
                match event {
                    Some(event) => settings.apply(&event),
                    None => {
                        watch = settings.watch().await?;
                        settings.load().await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use crate::tsdb::MemoryCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_supervised_loop_restarts_until_cancelled() {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let backoff = BackoffConfig {
            init: Duration::from_millis(1),
            max: Duration::from_millis(5),
            base: 2.0,
        };
        let task = {
            let runs = runs.clone();
            tokio::spawn(supervise("test loop", cancel.clone(), backoff, move |c: CancellationToken| {
                let run = runs.fetch_add(1, Ordering::SeqCst);
                async move {
                    match run {
                        0 => Err(RelayError::Meta("store unreachable".into())),
                        // a watch that ended without cancellation
                        1 => Ok(()),
                        _ => {
                            c.cancelled().await;
                            Ok(())
                        }
                    }
                }
            }))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "loop was not restarted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_member_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store: SharedMetaStore = Arc::new(MemoryMetaStore::new());
        let cluster = Arc::new(MemoryCluster::new());
        let config = ClusterConfig {
            node_name: "a".into(),
            data_location: "a:8086".into(),
            recovery_dir: dir.path().to_path_buf(),
            virtual_tokens: 8,
            ..Default::default()
        };
        let launcher = Launcher::start(config, store.clone(), cluster.clone()).await.unwrap();
        assert!(launcher.join_report().first);
        assert_eq!(launcher.join_report().tokens.len(), 8);
        assert_eq!(launcher.nodes().get("a").unwrap().status, NodeStatus::Up);
        assert!(!launcher.ping().await.unwrap().is_empty());

        let request = |q: &str| QueryRequest {
            database: "db".into(),
            query: q.into(),
            ..Default::default()
        };
        launcher.query(&request("CREATE DATABASE db")).await.unwrap();
        let summary = launcher
            .write(&WriteRequest::new("db", "cpu,host=a value=1 1"), None)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(cluster.get("a:8086").points("db").len(), 1);

        launcher
            .query(&request("CREATE PARTITION KEY host ON db"))
            .await
            .unwrap();
        assert!(launcher.partitioner().get_key_by_measurement("db", "cpu").is_some());
        launcher.shutdown().await;

        // restart keeps the tokens
        let config = ClusterConfig {
            node_name: "a".into(),
            data_location: "a:8086".into(),
            recovery_dir: dir.path().to_path_buf(),
            virtual_tokens: 8,
            ..Default::default()
        };
        let again = Launcher::start(config, store, cluster).await.unwrap();
        assert!(!again.join_report().first);
        assert_eq!(again.join_report().tokens, launcher.join_report().tokens);
        again.shutdown().await;
    }
}
