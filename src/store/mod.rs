//! Replication Engine
//!
//! The store owns every replicated database on this node. It asks the
//! [`Leaser`] whether this node may accept commits and otherwise follows the
//! lease holder as a replica.
//!
//! Commits hold the role gate shared; promotion and demotion hold it
//! exclusively, so a role change waits for in-flight commits and no commit
//! starts under a stale role.

mod database;
mod monitor;
mod registry;
mod replica;

pub use database::{list_databases, validate_name, Database};
pub use registry::{ReplicaRegistry, ReplicaState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::boundary::{CommitSink, Invalidator, PageDiff};
use crate::config::WolfLiteConfig;
use crate::error::{Error, Result};
use crate::lease::{Lease, Leaser, PrimaryInfo};
use crate::state::StateTracker;
use crate::stream::{Snapshot, StreamPosition, StreamServer};
use crate::txlog::retention::{enforce, retention_floor};
use crate::txlog::{Position, TxRecord};

/// Role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Lease not yet resolved
    Candidate,
    /// Holds the lease and accepts commits
    Primary,
    /// Follows the lease holder
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Primary => write!(f, "PRIMARY"),
            Role::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Status of one database
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatus {
    pub name: String,
    pub position: Position,
    pub checksum: u32,
    pub needs_resync: bool,
    /// Last primary position heard of, on replicas
    pub high_water: Option<Position>,
}

/// Point-in-time view of the store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub node_id: String,
    pub role: Role,
    pub ready: bool,
    /// Lease strategy
    pub lease: String,
    pub primary: Option<PrimaryInfo>,
    pub databases: Vec<DatabaseStatus>,
    /// Replicas streaming from this node, when primary
    pub replicas: Vec<ReplicaState>,
}

/// Role-dependent state guarded by the gate
struct Term {
    role: Role,
    lease: Option<Lease>,
    /// Cancelled when this node stops being primary
    primary_token: Option<CancellationToken>,
}

struct ReplicaTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct StoreInner {
    config: WolfLiteConfig,
    leaser: Arc<dyn Leaser>,
    invalidator: Arc<dyn Invalidator>,
    tracker: Arc<StateTracker>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    term: RwLock<Term>,
    replica: Mutex<Option<ReplicaTask>>,
    role_tx: watch::Sender<Role>,
    ready_tx: watch::Sender<bool>,
    /// Bumped whenever any database advances
    commits_tx: watch::Sender<u64>,
    registry: Arc<ReplicaRegistry>,
    /// Primary positions from the latest heartbeat
    high_water: Mutex<Option<HashMap<String, Position>>>,
    primary: RwLock<Option<PrimaryInfo>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Replication engine handle
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open the store and every database already on disk
    pub async fn open(
        config: WolfLiteConfig,
        leaser: Arc<dyn Leaser>,
        invalidator: Arc<dyn Invalidator>,
    ) -> Result<Self> {
        config.validate_node()?;
        std::fs::create_dir_all(config.databases_dir())?;

        let tracker = Arc::new(StateTracker::new(config.state_dir(), config.node.id.clone())?);
        if let Some(role) = tracker.last_role().await? {
            tracing::info!("Node {} was {} before restart", config.node.id, role);
        }

        let mut databases = HashMap::new();
        for name in list_databases(&config.databases_dir())? {
            let db = Database::open(
                config.databases_dir().join(&name),
                &name,
                &config.node.id,
                config.log.clone(),
                Arc::clone(&tracker),
            )
            .await?;
            tracing::info!("Opened database {} at position {}", name, db.tip().position);
            databases.insert(name, db);
        }

        let (role_tx, _) = watch::channel(Role::Candidate);
        let (ready_tx, _) = watch::channel(false);
        let (commits_tx, _) = watch::channel(0);
        let registry = Arc::new(ReplicaRegistry::new(config.retention.replica_grace()));

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                leaser,
                invalidator,
                tracker,
                databases: RwLock::new(databases),
                term: RwLock::new(Term {
                    role: Role::Candidate,
                    lease: None,
                    primary_token: None,
                }),
                replica: Mutex::new(None),
                role_tx,
                ready_tx,
                commits_tx,
                registry,
                high_water: Mutex::new(None),
                primary: RwLock::new(None),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind the configured stream address and start the background tasks
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.inner.config.node.bind_address).await?;
        self.start_with_listener(listener).await
    }

    /// Start the background tasks, serving the stream on `listener`
    pub async fn start_with_listener(&self, listener: TcpListener) -> Result<SocketAddr> {
        let server = StreamServer::from_listener(listener, self.clone())?;
        let addr = server.local_addr();
        tracing::info!(
            "Starting node {} (stream on {}, advertised as {})",
            self.node_id(),
            addr,
            self.inner.leaser.advertise_addr()
        );

        let mut tasks = self.inner.tasks.lock().await;

        let token = self.inner.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("Stream server failed: {}", e);
            }
        }));

        let store = self.clone();
        let token = self.inner.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            monitor::run(store, token).await;
        }));

        let store = self.clone();
        let token = self.inner.shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            store.retention_loop(token).await;
        }));

        Ok(addr)
    }

    /// Stop all tasks and release the lease
    pub async fn close(&self) -> Result<()> {
        tracing::info!("Closing node {}", self.node_id());
        let lease = self.stop().await;

        if let Some(lease) = lease {
            self.inner.leaser.release(&lease).await?;
            tracing::info!("Released lease");
        }
        Ok(())
    }

    /// Stop all tasks without releasing the lease, as a crash would
    pub async fn abandon(&self) {
        tracing::warn!("Abandoning node {} without releasing its lease", self.node_id());
        self.stop().await;
    }

    async fn stop(&self) -> Option<Lease> {
        self.inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.stop_replica().await;

        let mut term = self.inner.term.write().await;
        if let Some(token) = term.primary_token.take() {
            token.cancel();
        }
        term.role = Role::Candidate;
        self.inner.role_tx.send_replace(Role::Candidate);
        self.inner.ready_tx.send_replace(false);
        term.lease.take()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node.id
    }

    pub fn config(&self) -> &WolfLiteConfig {
        &self.inner.config
    }

    pub fn role(&self) -> Role {
        *self.inner.role_tx.borrow()
    }

    /// Watch role changes
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.inner.role_tx.subscribe()
    }

    pub fn ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    /// Wait until the role is resolved and, on a replica, initial catch-up is done
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.inner.ready_tx.subscribe();
        tokio::select! {
            result = ready.wait_for(|r| *r) => {
                result.map_err(|_| Error::ShuttingDown)?;
                Ok(())
            }
            _ = self.inner.shutdown.cancelled() => Err(Error::ShuttingDown),
        }
    }

    /// Watch a counter bumped whenever any database advances
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.inner.commits_tx.subscribe()
    }

    pub fn registry(&self) -> Arc<ReplicaRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Token of the current primary term, if this node is primary
    pub async fn primary_token(&self) -> Option<CancellationToken> {
        let term = self.inner.term.read().await;
        match term.role {
            Role::Primary => term.primary_token.clone(),
            _ => None,
        }
    }

    pub async fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.inner.databases.read().await.get(name).cloned()
    }

    /// All databases, ordered by name
    pub async fn databases(&self) -> Vec<Arc<Database>> {
        let databases = self.inner.databases.read().await;
        let mut list: Vec<Arc<Database>> = databases.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Applied position of a database, 0 if it does not exist
    pub async fn position(&self, name: &str) -> Position {
        match self.database(name).await {
            Some(db) => db.tip().position,
            None => 0,
        }
    }

    /// Positions to subscribe with
    pub async fn stream_positions(&self) -> Vec<StreamPosition> {
        self.databases()
            .await
            .iter()
            .map(|db| {
                let tip = db.tip();
                StreamPosition {
                    database: db.name().to_string(),
                    position: tip.position,
                    checksum: tip.chain,
                    resync: db.needs_resync(),
                }
            })
            .collect()
    }

    /// Log and apply a commit from the interception layer
    pub async fn commit(&self, database: &str, diff: PageDiff) -> Result<Position> {
        let term = self.inner.term.read().await;

        if term.role != Role::Primary {
            let err = Error::NotPrimary {
                database: database.to_string(),
            };
            tracing::error!("{} (role {})", err, term.role);
            return Err(err);
        }

        if let Some(lease) = &term.lease {
            if !lease.is_valid_at(Instant::now()) {
                tracing::warn!("Refusing commit to {}: lease deadline passed", database);
                return Err(Error::LeaseExpired);
            }
        }

        diff.validate()?;
        let db = self.open_database(database).await?;
        let record = db.commit(diff).await?;
        self.bump_commits();

        Ok(record.position)
    }

    /// Apply a record received from the primary
    pub async fn apply_record(&self, record: TxRecord) -> Result<()> {
        let term = self.inner.term.read().await;
        if term.role == Role::Primary {
            return Err(Error::Replication(format!(
                "primary cannot apply replicated record {} of {}",
                record.position, record.database
            )));
        }

        let db = self.open_database(&record.database).await?;
        match db.apply_record(record).await {
            Ok(ranges) => {
                self.inner.invalidator.invalidate(db.name(), &ranges);
                self.bump_commits();
                Ok(())
            }
            Err(e) => {
                if e.requires_resync() {
                    db.mark_resync();
                }
                Err(e)
            }
        }
    }

    /// Replace a database with a snapshot received from the primary
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let term = self.inner.term.read().await;
        if term.role == Role::Primary {
            return Err(Error::Replication(format!(
                "primary cannot apply snapshot of {}",
                snapshot.database
            )));
        }

        let db = self.open_database(&snapshot.database).await?;
        let ranges = db.apply_snapshot(snapshot).await?;
        self.inner.invalidator.invalidate(db.name(), &ranges);
        self.bump_commits();
        Ok(())
    }

    /// Current status snapshot
    pub async fn status(&self) -> StoreStatus {
        let high_water = self.inner.high_water.lock().await.clone();
        let databases = self
            .databases()
            .await
            .iter()
            .map(|db| {
                let tip = db.tip();
                DatabaseStatus {
                    name: db.name().to_string(),
                    position: tip.position,
                    checksum: tip.chain,
                    needs_resync: db.needs_resync(),
                    high_water: high_water
                        .as_ref()
                        .and_then(|hw| hw.get(db.name()).copied()),
                }
            })
            .collect();

        let role = self.role();
        let replicas = if role == Role::Primary {
            self.inner.registry.snapshot().await
        } else {
            Vec::new()
        };

        StoreStatus {
            node_id: self.node_id().to_string(),
            role,
            ready: self.ready(),
            lease: self.inner.leaser.kind().to_string(),
            primary: self.inner.primary.read().await.clone(),
            databases,
            replicas,
        }
    }

    /// Delete log segments no one needs any more
    pub async fn enforce_retention(&self) -> Result<usize> {
        let retention = self.inner.config.retention.duration();
        self.inner.registry.prune().await;

        let mut deleted = 0;
        for db in self.databases().await {
            let replicas = self.inner.registry.floor_positions(db.name()).await;
            let floor = retention_floor(db.tip().position, replicas);

            let mut reader = db.reader()?;
            match enforce(&mut reader, db.name(), floor, retention, chrono::Utc::now()) {
                Ok(segments) => deleted += segments.len(),
                Err(e) => tracing::warn!("Retention failed for {}: {}", db.name(), e),
            }
        }

        Ok(deleted)
    }

    async fn retention_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.retention.monitor_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.enforce_retention().await {
                tracing::warn!("Retention cycle failed: {}", e);
            }
        }
    }

    async fn open_database(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(db) = self.database(name).await {
            return Ok(db);
        }
        validate_name(name)?;

        let mut databases = self.inner.databases.write().await;
        if let Some(db) = databases.get(name) {
            return Ok(Arc::clone(db));
        }

        let config = &self.inner.config;
        let db = Database::open(
            config.databases_dir().join(name),
            name,
            &config.node.id,
            config.log.clone(),
            Arc::clone(&self.inner.tracker),
        )
        .await?;
        tracing::info!("Created database {}", name);
        databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    fn bump_commits(&self) {
        self.inner.commits_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn leaser(&self) -> &Arc<dyn Leaser> {
        &self.inner.leaser
    }

    async fn set_primary_info(&self, info: Option<PrimaryInfo>) {
        *self.inner.primary.write().await = info;
    }

    fn set_ready(&self, ready: bool) {
        self.inner.ready_tx.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    /// Record the primary's positions from a heartbeat
    async fn record_high_water(&self, positions: &[StreamPosition]) {
        let mut high_water = self.inner.high_water.lock().await;
        let map = high_water.get_or_insert_with(HashMap::new);
        for p in positions {
            map.insert(p.database.clone(), p.position);
        }
    }

    /// Whether every database has reached the last heard-of primary position
    async fn caught_up(&self) -> bool {
        let high_water = self.inner.high_water.lock().await.clone();

        for db in self.databases().await {
            if db.needs_resync() {
                return false;
            }
        }

        let Some(high_water) = high_water else {
            return true;
        };
        for (name, position) in high_water {
            if self.position(&name).await < position {
                return false;
            }
        }
        true
    }

    /// Take the lease and start accepting commits
    async fn promote(&self, lease: Lease) -> Result<()> {
        // The replica task applies records under the shared gate; it must be
        // gone before the gate is taken exclusively
        self.stop_replica().await;

        let mut term = self.inner.term.write().await;
        let token = self.inner.shutdown.child_token();
        term.role = Role::Primary;
        term.lease = Some(lease.clone());
        term.primary_token = Some(token);
        drop(term);

        self.inner.registry.clear().await;
        *self.inner.high_water.lock().await = None;
        self.set_primary_info(Some(lease.primary_info())).await;
        self.inner.role_tx.send_replace(Role::Primary);
        self.set_ready(true);

        tracing::info!("Node {} is now PRIMARY", self.node_id());
        if let Err(e) = self.inner.tracker.set_last_role(&Role::Primary.to_string()).await {
            tracing::warn!("Failed to record role: {}", e);
        }
        Ok(())
    }

    /// Stop accepting commits, then release the lease if still held
    async fn demote(&self, reason: &str) {
        let mut term = self.inner.term.write().await;
        if let Some(token) = term.primary_token.take() {
            token.cancel();
        }
        let lease = term.lease.take();
        term.role = Role::Candidate;
        drop(term);

        self.inner.role_tx.send_replace(Role::Candidate);
        self.set_ready(false);
        self.set_primary_info(None).await;
        tracing::warn!("Node {} stepped down: {}", self.node_id(), reason);

        if let Some(lease) = lease {
            if let Err(e) = self.inner.leaser.release(&lease).await {
                tracing::debug!("Release after demotion failed: {}", e);
            }
        }
    }

    /// Lease held by the current term
    async fn current_lease(&self) -> Option<Lease> {
        self.inner.term.read().await.lease.clone()
    }

    async fn store_lease(&self, lease: Lease) {
        let mut term = self.inner.term.write().await;
        if term.role == Role::Primary {
            term.lease = Some(lease);
        }
    }

    /// Follow the lease holder; a no-op if already following
    async fn become_replica(&self) {
        let mut replica = self.inner.replica.lock().await;
        if replica.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let mut term = self.inner.term.write().await;
        let was = term.role;
        if let Some(token) = term.primary_token.take() {
            token.cancel();
        }
        term.role = Role::Replica;
        term.lease = None;
        drop(term);

        let token = self.inner.shutdown.child_token();
        let store = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            replica::run(store, task_token).await;
        });
        *replica = Some(ReplicaTask { token, handle });

        self.inner.role_tx.send_replace(Role::Replica);
        if was != Role::Replica {
            tracing::info!("Node {} is now REPLICA", self.node_id());
            if let Err(e) = self.inner.tracker.set_last_role(&Role::Replica.to_string()).await {
                tracing::warn!("Failed to record role: {}", e);
            }
        }
    }

    async fn stop_replica(&self) {
        let task = self.inner.replica.lock().await.take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

#[async_trait]
impl CommitSink for Store {
    async fn on_commit(&self, database: &str, diff: PageDiff) -> Result<Position> {
        self.commit(database, diff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{ByteRange, NoopInvalidator, Page};
    use crate::config::StaticConfig;
    use crate::lease::StaticLeaser;
    use crate::stream::{Message, StreamClient};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, node: &str) -> WolfLiteConfig {
        let mut config = WolfLiteConfig::new(node, dir);
        config.node.bind_address = "127.0.0.1:0".into();
        config.log.fsync = false;
        config
    }

    fn static_leaser(primary: bool, node: &str) -> Arc<dyn Leaser> {
        Arc::new(StaticLeaser::new(
            &StaticConfig {
                primary,
                hostname: "node-1".into(),
                advertise_address: "127.0.0.1:1".into(),
            },
            node,
        ))
    }

    fn page_diff(fill: u8) -> PageDiff {
        PageDiff::new(
            512,
            1,
            vec![Page {
                pgno: 1,
                data: vec![fill; 512],
            }],
        )
    }

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<(String, Vec<ByteRange>)>>,
    }

    impl Invalidator for Recorder {
        fn invalidate(&self, database: &str, ranges: &[ByteRange]) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((database.to_string(), ranges.to_vec()));
            }
        }
    }

    /// Leaser with a TTL whose outcomes the test switches
    struct ScriptedLeaser {
        node: String,
        ttl: Duration,
        renew_fails: AtomicBool,
        acquire_fails: AtomicBool,
        releases: AtomicUsize,
    }

    impl ScriptedLeaser {
        fn new(node: &str, ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                node: node.to_string(),
                ttl,
                renew_fails: AtomicBool::new(false),
                acquire_fails: AtomicBool::new(false),
                releases: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Leaser for ScriptedLeaser {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn advertise_addr(&self) -> &str {
            "127.0.0.1:1"
        }

        async fn acquire(&self) -> Result<Lease> {
            if self.acquire_fails.load(Ordering::SeqCst) {
                return Err(Error::LeaseUnavailable("lock service down".into()));
            }
            Ok(Lease::new(
                self.node.clone(),
                self.advertise_addr().to_string(),
                Some(self.ttl),
                None,
                Instant::now(),
            ))
        }

        async fn renew(&self, lease: &Lease) -> Result<Lease> {
            if self.renew_fails.load(Ordering::SeqCst) {
                return Err(Error::LeaseLost);
            }
            Ok(lease.renewed(Instant::now()))
        }

        async fn release(&self, _lease: &Lease) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
            Ok(Some(PrimaryInfo {
                hostname: "node-9".into(),
                advertise_addr: "127.0.0.1:1".into(),
            }))
        }
    }

    fn chained_records(diffs: Vec<PageDiff>) -> Vec<TxRecord> {
        let mut chain = 0;
        diffs
            .into_iter()
            .enumerate()
            .map(|(i, diff)| {
                let record = TxRecord::new("app.db".into(), i as u64 + 1, diff, chain, "node-9".into());
                chain = record.chain();
                record
            })
            .collect()
    }

    #[tokio::test]
    async fn test_commit_requires_primary() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            config(dir.path(), "node-1"),
            static_leaser(true, "node-1"),
            Arc::new(NoopInvalidator),
        )
        .await
        .unwrap();

        let err = store.commit("app.db", page_diff(1)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.role(), Role::Candidate);
    }

    #[tokio::test]
    async fn test_static_primary_accepts_commits() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            config(dir.path(), "node-1"),
            static_leaser(true, "node-1"),
            Arc::new(NoopInvalidator),
        )
        .await
        .unwrap();
        store.start().await.unwrap();
        store.wait_ready().await.unwrap();
        assert_eq!(store.role(), Role::Primary);

        assert_eq!(store.on_commit("app.db", page_diff(1)).await.unwrap(), 1);
        assert_eq!(store.commit("app.db", page_diff(2)).await.unwrap(), 2);
        assert!(matches!(
            store.commit("../escape", page_diff(3)).await,
            Err(Error::InvalidDatabaseName(_))
        ));

        let status = store.status().await;
        assert_eq!(status.role, Role::Primary);
        assert_eq!(status.lease, "static");
        assert_eq!(status.databases.len(), 1);
        assert_eq!(status.databases[0].position, 2);

        store.close().await.unwrap();
        assert_eq!(store.role(), Role::Candidate);
    }

    #[tokio::test]
    async fn test_reopen_keeps_databases() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(
                config(dir.path(), "node-1"),
                static_leaser(true, "node-1"),
                Arc::new(NoopInvalidator),
            )
            .await
            .unwrap();
            store.start().await.unwrap();
            store.wait_ready().await.unwrap();
            for i in 0..3 {
                store.commit("app.db", page_diff(i)).await.unwrap();
            }
            store.close().await.unwrap();
        }

        let store = Store::open(
            config(dir.path(), "node-1"),
            static_leaser(true, "node-1"),
            Arc::new(NoopInvalidator),
        )
        .await
        .unwrap();
        assert_eq!(store.position("app.db").await, 3);
        assert_eq!(store.position("missing.db").await, 0);
    }

    #[tokio::test]
    async fn test_replica_apply_invalidates() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = Store::open(
            config(dir.path(), "node-2"),
            static_leaser(true, "node-2"),
            recorder.clone(),
        )
        .await
        .unwrap();

        let record = TxRecord::new("app.db".into(), 1, page_diff(7), 0, "node-1".into());
        store.apply_record(record.clone()).await.unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("app.db".to_string(), vec![ByteRange::new(0, 512)])]);

        // Out of order records flag the database instead of applying
        let skipped = TxRecord::new("app.db".into(), 3, page_diff(9), record.chain(), "node-1".into());
        assert!(store.apply_record(skipped).await.unwrap_err().requires_resync());
        let db = store.database("app.db").await.unwrap();
        assert!(db.needs_resync());
        assert!(!store.caught_up().await);
    }

    #[tokio::test]
    async fn test_replica_invalidates_truncated_tail() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = Store::open(
            config(dir.path(), "node-2"),
            static_leaser(false, "node-2"),
            recorder.clone(),
        )
        .await
        .unwrap();

        let pages = (1..=4).map(|pgno| Page { pgno, data: vec![pgno as u8; 512] }).collect();
        let shrink = PageDiff::new(
            512,
            2,
            vec![Page {
                pgno: 1,
                data: vec![0xee; 512],
            }],
        );
        for record in chained_records(vec![PageDiff::new(512, 4, pages), shrink]) {
            store.apply_record(record).await.unwrap();
        }

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec![ByteRange::new(0, 2048)]);
        assert_eq!(
            calls[1].1,
            vec![ByteRange::new(0, 512), ByteRange::new(1024, 1024)]
        );

        let db = store.database("app.db").await.unwrap();
        assert_eq!(std::fs::metadata(db.image_path()).unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_commits_and_streams() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "node-1");
        config.stream.heartbeat_interval_ms = 50;
        config.stream.backoff_min_ms = 10;
        config.stream.backoff_max_ms = 50;

        let leaser = ScriptedLeaser::new("node-1", Duration::from_millis(300));
        let store = Store::open(config, leaser.clone(), Arc::new(NoopInvalidator))
            .await
            .unwrap();
        let addr = store.start().await.unwrap();
        store.wait_ready().await.unwrap();
        assert_eq!(store.role(), Role::Primary);
        assert_eq!(store.commit("app.db", page_diff(1)).await.unwrap(), 1);

        let mut conn = StreamClient::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        conn.send(&Message::Subscribe {
            node_id: "node-2".into(),
            databases: Vec::new(),
        })
        .await
        .unwrap();
        assert!(matches!(
            conn.recv(Duration::from_secs(1)).await.unwrap(),
            Message::Heartbeat { .. }
        ));

        // The lock service forgets this node and will not hand the lease back
        leaser.acquire_fails.store(true, Ordering::SeqCst);
        leaser.renew_fails.store(true, Ordering::SeqCst);

        let mut role = store.subscribe_role();
        tokio::time::timeout(Duration::from_secs(5), role.wait_for(|r| *r != Role::Primary))
            .await
            .unwrap()
            .unwrap();

        let err = store.commit("app.db", page_diff(2)).await.unwrap_err();
        assert!(matches!(err, Error::NotPrimary { .. }));
        assert!(err.is_fatal());
        assert_eq!(store.position("app.db").await, 1);

        // The outbound stream is closed rather than left idle
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while conn.recv(Duration::from_secs(1)).await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(leaser.releases.load(Ordering::SeqCst), 1);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_replica_releases_won_lease() {
        let dir = tempdir().unwrap();
        let leaser = ScriptedLeaser::new("node-2", Duration::from_secs(10));
        let store = Store::open(
            config(dir.path(), "node-2"),
            leaser.clone(),
            Arc::new(NoopInvalidator),
        )
        .await
        .unwrap();

        store.become_replica().await;
        assert_eq!(store.role(), Role::Replica);

        let records = chained_records((1..=5).map(page_diff).collect());
        store.apply_record(records[0].clone()).await.unwrap();
        store
            .record_high_water(&[StreamPosition {
                database: "app.db".into(),
                position: 5,
                checksum: 0,
                resync: false,
            }])
            .await;
        assert!(!store.caught_up().await);

        let mut backoff = monitor::Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        monitor::seek_lease(&store, &mut backoff).await;
        assert_eq!(store.role(), Role::Replica);
        assert!(store.current_lease().await.is_none());
        assert_eq!(leaser.releases.load(Ordering::SeqCst), 1);

        // Once caught up the same node may take over
        for record in &records[1..] {
            store.apply_record(record.clone()).await.unwrap();
        }
        monitor::seek_lease(&store, &mut backoff).await;
        assert_eq!(store.role(), Role::Primary);
        assert_eq!(leaser.releases.load(Ordering::SeqCst), 1);

        store.close().await.unwrap();
        assert_eq!(leaser.releases.load(Ordering::SeqCst), 2);
    }
}
