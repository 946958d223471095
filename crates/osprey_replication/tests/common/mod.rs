//! Shared fixtures for the source manager integration tests: a recording
//! mock source, a test server that captures aborts instead of dying, a
//! fault-injecting queue storage, and a flaky remote filesystem.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use osprey_common::config::ReplicationConfig;
use osprey_common::error::{OspreyResult, ReplicationError};
use osprey_common::types::ServerName;
use osprey_replication::manager::{ReplicationSourceManager, Server};
use osprey_replication::metrics::SourceMetrics;
use osprey_replication::peer::{PeerConfig, ReplicationMode, ReplicationPeer, ReplicationPeers};
use osprey_replication::queue::QueueId;
use osprey_replication::source::{ReplicationSource, SourceFactory};
use osprey_replication::storage::{MemoryQueueStorage, QueueStorage, StorageResult};
use osprey_replication::wal::WalFs;

pub const LIVE_NODE: &str = "node_live";
pub const DEAD_NODE: &str = "node_dead";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("osprey_replication=trace")
        .try_init();
}

/// Poll `cond` until it holds or `deadline` passes.
pub fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// ---------------------------------------------------------------------------
// TestServer
// ---------------------------------------------------------------------------

pub struct TestServer {
    name: ServerName,
    stopped: AtomicBool,
    sync_up_host: AtomicBool,
    aborts: Mutex<Vec<String>>,
}

impl TestServer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: ServerName::from(name),
            stopped: AtomicBool::new(false),
            sync_up_host: AtomicBool::new(false),
            aborts: Mutex::new(Vec::new()),
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn set_sync_up_host(&self, value: bool) {
        self.sync_up_host.store(value, Ordering::SeqCst);
    }

    pub fn abort_reasons(&self) -> Vec<String> {
        self.aborts.lock().clone()
    }

    pub fn aborted(&self) -> bool {
        !self.aborts.lock().is_empty()
    }
}

impl Server for TestServer {
    fn server_name(&self) -> &ServerName {
        &self.name
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn abort(&self, reason: &str, error: Option<&dyn std::error::Error>) {
        let detail = match error {
            Some(e) => format!("{reason}: {e}"),
            None => reason.to_string(),
        };
        self.aborts.lock().push(detail);
    }

    fn is_sync_up_host(&self) -> bool {
        self.sync_up_host.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MockSource / MockFactory
// ---------------------------------------------------------------------------

/// Records every call the manager makes; ships nothing.
pub struct MockSource {
    queue_id: QueueId,
    peer: Arc<ReplicationPeer>,
    metrics: SourceMetrics,
    active: AtomicBool,
    started: AtomicBool,
    terminations: Mutex<Vec<(String, bool)>>,
    enqueued: Mutex<Vec<PathBuf>>,
    hfile_refs: Mutex<Vec<(String, usize)>>,
}

impl MockSource {
    fn new(queue_id: QueueId, peer: Arc<ReplicationPeer>) -> Self {
        Self {
            queue_id,
            peer,
            metrics: SourceMetrics::default(),
            active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            terminations: Mutex::new(Vec::new()),
            enqueued: Mutex::new(Vec::new()),
            hfile_refs: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueued(&self) -> Vec<PathBuf> {
        self.enqueued.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        !self.terminations.lock().is_empty()
    }

    pub fn termination_reason(&self) -> Option<String> {
        self.terminations.lock().first().map(|(r, _)| r.clone())
    }

    pub fn metrics_cleared_on_terminate(&self) -> Option<bool> {
        self.terminations.lock().first().map(|(_, c)| *c)
    }

    pub fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::SeqCst);
    }

    pub fn hfile_ref_calls(&self) -> Vec<(String, usize)> {
        self.hfile_refs.lock().clone()
    }
}

impl ReplicationSource for MockSource {
    fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    fn peer(&self) -> &Arc<ReplicationPeer> {
        &self.peer
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn enqueue_log(&self, wal: &Path) {
        self.metrics.logs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.enqueued.lock().push(wal.to_path_buf());
    }

    fn startup(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    fn terminate(&self, reason: &str, clear_metrics: bool) {
        self.active.store(false, Ordering::SeqCst);
        if clear_metrics {
            self.metrics.clear();
        }
        self.terminations
            .lock()
            .push((reason.to_string(), clear_metrics));
    }

    fn metrics(&self) -> &SourceMetrics {
        &self.metrics
    }

    fn stats(&self) -> String {
        let snap = self.metrics.snapshot();
        format!(
            "logs_enqueued={}, batches_shipped={}",
            snap.logs_enqueued, snap.batches_shipped
        )
    }

    fn add_hfile_refs(
        &self,
        table: &str,
        _family: &[u8],
        pairs: &[(PathBuf, PathBuf)],
    ) -> Result<(), ReplicationError> {
        self.hfile_refs.lock().push((table.to_string(), pairs.len()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockSource>>>,
}

impl MockFactory {
    pub fn created(&self) -> Vec<Arc<MockSource>> {
        self.created.lock().clone()
    }

    /// Most recent source created for `queue_id` (rendered form).
    pub fn source_for(&self, queue_id: &str) -> Option<Arc<MockSource>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|s| s.queue_id.to_string() == queue_id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl SourceFactory for MockFactory {
    fn create(
        &self,
        queue_id: QueueId,
        peer: Arc<ReplicationPeer>,
    ) -> OspreyResult<Arc<dyn ReplicationSource>> {
        let src = Arc::new(MockSource::new(queue_id, peer));
        self.created.lock().push(Arc::clone(&src));
        Ok(src as Arc<dyn ReplicationSource>)
    }
}

// ---------------------------------------------------------------------------
// FlakyWalFs
// ---------------------------------------------------------------------------

/// Remote filesystem whose first `failures` delete calls error out.
pub struct FlakyWalFs {
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
    deleted: Mutex<Vec<PathBuf>>,
}

impl FlakyWalFs {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<PathBuf> {
        self.deleted.lock().clone()
    }

    pub fn fail_next(&self, failures: u32) {
        self.failures_remaining.store(failures, Ordering::SeqCst);
    }
}

impl WalFs for FlakyWalFs {
    fn delete(&self, path: &Path) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::other("injected remote fs failure"));
        }
        self.deleted.lock().push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// FaultyQueueStorage
// ---------------------------------------------------------------------------

/// In-memory queue storage with per-operation fault injection and a gate
/// that lets a test freeze `claim_queue` mid-flight to race it against peer
/// operations.
pub struct FaultyQueueStorage {
    inner: MemoryQueueStorage,
    fail_add_wal: Mutex<Option<ReplicationError>>,
    fail_set_wal_position: Mutex<Option<ReplicationError>>,
    hold_claims: AtomicBool,
    in_claim: AtomicBool,
}

impl FaultyQueueStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryQueueStorage::new(),
            fail_add_wal: Mutex::new(None),
            fail_set_wal_position: Mutex::new(None),
            hold_claims: AtomicBool::new(false),
            in_claim: AtomicBool::new(false),
        })
    }

    pub fn fail_next_add_wal(&self, error: ReplicationError) {
        *self.fail_add_wal.lock() = Some(error);
    }

    pub fn fail_next_set_wal_position(&self, error: ReplicationError) {
        *self.fail_set_wal_position.lock() = Some(error);
    }

    /// Make the next `claim_queue` block until `release_claims` is called.
    pub fn hold_claims(&self) {
        self.hold_claims.store(true, Ordering::SeqCst);
    }

    pub fn release_claims(&self) {
        self.hold_claims.store(false, Ordering::SeqCst);
    }

    /// True while a claim is parked inside the gate.
    pub fn claim_in_progress(&self) -> bool {
        self.in_claim.load(Ordering::SeqCst)
    }
}

impl Deref for FaultyQueueStorage {
    type Target = MemoryQueueStorage;

    fn deref(&self) -> &MemoryQueueStorage {
        &self.inner
    }
}

impl QueueStorage for FaultyQueueStorage {
    fn add_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()> {
        if let Some(error) = self.fail_add_wal.lock().take() {
            return Err(error);
        }
        self.inner.add_wal(server, queue, wal)
    }

    fn remove_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()> {
        self.inner.remove_wal(server, queue, wal)
    }

    fn set_wal_position(
        &self,
        server: &ServerName,
        queue: &QueueId,
        wal: &str,
        position: u64,
        last_seq_ids: HashMap<String, u64>,
    ) -> StorageResult<()> {
        if let Some(error) = self.fail_set_wal_position.lock().take() {
            return Err(error);
        }
        self.inner
            .set_wal_position(server, queue, wal, position, last_seq_ids)
    }

    fn remove_queue(&self, server: &ServerName, queue: &QueueId) -> StorageResult<()> {
        self.inner.remove_queue(server, queue)
    }

    fn get_all_queues(&self, server: &ServerName) -> StorageResult<Vec<QueueId>> {
        self.inner.get_all_queues(server)
    }

    fn claim_queue(
        &self,
        dead_server: &ServerName,
        queue: &QueueId,
        target: &ServerName,
    ) -> StorageResult<(QueueId, BTreeSet<String>)> {
        if self.hold_claims.load(Ordering::SeqCst) {
            self.in_claim.store(true, Ordering::SeqCst);
            while self.hold_claims.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.in_claim.store(false, Ordering::SeqCst);
        }
        self.inner.claim_queue(dead_server, queue, target)
    }

    fn add_peer_to_hfile_refs(&self, peer_id: &str) -> StorageResult<()> {
        self.inner.add_peer_to_hfile_refs(peer_id)
    }

    fn remove_peer_from_hfile_refs(&self, peer_id: &str) -> StorageResult<()> {
        self.inner.remove_peer_from_hfile_refs(peer_id)
    }

    fn remove_hfile_refs(&self, peer_id: &str, files: &[String]) -> StorageResult<()> {
        self.inner.remove_hfile_refs(peer_id, files)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub manager: Arc<ReplicationSourceManager>,
    pub storage: Arc<FaultyQueueStorage>,
    pub peers: Arc<ReplicationPeers>,
    pub server: Arc<TestServer>,
    pub factory: Arc<MockFactory>,
    pub fs: Arc<FlakyWalFs>,
}

impl TestHarness {
    pub fn server_name(&self) -> ServerName {
        ServerName::from(LIVE_NODE)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from("/osprey/wals")
    }

    pub fn old_log_dir(&self) -> PathBuf {
        PathBuf::from("/osprey/oldwals")
    }

    /// Define and activate an async peer through the manager.
    pub fn add_async_peer(&self, peer_id: &str) -> Arc<MockSource> {
        self.peers.define_peer(peer_id, async_peer_config());
        self.manager.add_peer(peer_id).unwrap();
        self.factory.source_for(peer_id).unwrap()
    }

    /// Define and activate a sync-replication peer through the manager.
    pub fn add_sync_peer(&self, peer_id: &str) -> Arc<MockSource> {
        self.peers.define_peer(peer_id, sync_peer_config());
        self.manager.add_peer(peer_id).unwrap();
        self.factory.source_for(peer_id).unwrap()
    }

    pub fn roll_log(&self, name: &str) -> PathBuf {
        let path = self.log_dir().join(name);
        self.manager.pre_log_roll(&path).unwrap();
        self.manager.post_log_roll(&path);
        path
    }

    pub fn wait_for_failover_tasks(&self) -> bool {
        wait_until(Duration::from_secs(10), || {
            self.manager.active_failover_task_count() == 0
        })
    }
}

pub fn async_peer_config() -> PeerConfig {
    PeerConfig {
        endpoint: "osprey://cluster-b".into(),
        mode: ReplicationMode::Async,
        remote_wal_dir: None,
    }
}

pub fn sync_peer_config() -> PeerConfig {
    PeerConfig {
        endpoint: "osprey://cluster-b".into(),
        mode: ReplicationMode::Sync,
        remote_wal_dir: Some(PathBuf::from("/remote/wals")),
    }
}

pub fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        sleep_before_failover_ms: 1,
        executor_workers: 1,
        sync_sleep_for_retries_ms: 1,
        sync_max_retries_multiplier: 60,
        bulkload_enabled: false,
        total_buffer_limit_bytes: 1024,
    }
}

pub fn harness() -> TestHarness {
    harness_with(test_config())
}

pub fn harness_with(config: ReplicationConfig) -> TestHarness {
    init_tracing();
    let storage = FaultyQueueStorage::new();
    let peers = Arc::new(ReplicationPeers::new());
    let server = TestServer::new(LIVE_NODE);
    let factory = Arc::new(MockFactory::default());
    let fs = FlakyWalFs::new(0);
    let manager = Arc::new(
        ReplicationSourceManager::new(
            Arc::clone(&storage) as Arc<dyn QueueStorage>,
            Arc::clone(&peers),
            Arc::clone(&server) as Arc<dyn Server>,
            Arc::clone(&factory) as Arc<dyn SourceFactory>,
            Arc::clone(&fs) as Arc<dyn WalFs>,
            &config,
            PathBuf::from("/osprey/wals"),
            PathBuf::from("/osprey/oldwals"),
        )
        .unwrap(),
    );
    TestHarness {
        manager,
        storage,
        peers,
        server,
        factory,
        fs,
    }
}
