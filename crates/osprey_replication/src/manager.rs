//! The replication source manager.
//!
//! Owns every replication source on this node. There are two classes of
//! sources:
//!
//! - *Normal* sources are persistent, exactly one per peer cluster.
//! - *Recovered* sources drain a WAL queue claimed from a dead node and are
//!   dropped once that queue is empty.
//!
//! When a node dies, the cluster's death watcher calls
//! [`ReplicationSourceManager::claim_queue`] for each of its queues; the
//! manager adopts the queue through the storage's atomic claim and spawns a
//! recovered source for it.
//!
//! # Synchronization
//!
//! Lock order is `latest_paths` then `wals_by_id`; the recovered-source lock
//! is disjoint from both and is always taken on its own. Rules:
//!
//! - `sources` is a concurrent map; peer-level mutations are serialized per
//!   peer id by the surrounding peer procedure handler, so the map itself
//!   never needs an outer lock.
//! - `wals_by_id` is mutated by `pre_log_roll`, `clean_old_logs`,
//!   `add_source`/`remove_source`, and `drain_sources`, each under its lock.
//! - The recovered WAL index lives inside [`RecoveredSources`] and is only
//!   reachable through the recovered-source lock, making the single-writer
//!   rule structural.
//! - `latest_paths` is held across source seeding so a concurrent log roll
//!   cannot slip a WAL between "seed from latest" and "receive new logs".
//! - No storage deletion or remote-filesystem call happens while holding
//!   `wals_by_id` or the recovered lock beyond single-entry registrations
//!   that must stay transactional with the in-memory state: snapshot under
//!   the lock, act outside, subtract under the lock again.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use osprey_common::config::ReplicationConfig;
use osprey_common::error::{OspreyError, OspreyResult, ReplicationError};
use osprey_common::shutdown::StopSignal;
use osprey_common::types::ServerName;

use crate::failover::{jitter_fraction, FailoverExecutor};
use crate::metrics::GlobalSourceMetrics;
use crate::peer::{ReplicationPeers, SyncPeerMapping, SyncReplicationState,
    LEGACY_REGION_REPLICATION_ENDPOINT};
use crate::queue::{QueueId, WalIndex};
use crate::source::{ReplicationSource, SourceFactory};
use crate::storage::QueueStorage;
use crate::wal::{wal_name, sync_replication_peer_id, wal_prefix, WalEntry, WalEntryBatch, WalFs};

/// The node hosting this manager: identity, stop flag, and the fatal abort
/// hook. Aborting is the intentional failure-containment policy for storage
/// errors that would let the in-memory model diverge from durable state.
pub trait Server: Send + Sync {
    fn server_name(&self) -> &ServerName;

    fn is_stopped(&self) -> bool;

    /// Begin fatal node shutdown. Must be safe to call from any thread and
    /// must not block; callers continue (and usually return an error) after
    /// invoking it.
    fn abort(&self, reason: &str, error: Option<&dyn std::error::Error>);

    /// True when this process is the offline sync-up utility rather than a
    /// real node; claimed queues of disabled peers are skipped there.
    fn is_sync_up_host(&self) -> bool {
        false
    }
}

/// Recovered sources and their WAL index, guarded together: whoever holds
/// this lock is the only writer of either.
#[derive(Default)]
struct RecoveredSources {
    list: Vec<Arc<dyn ReplicationSource>>,
    wals: WalIndex,
}

pub struct ReplicationSourceManager {
    /// One normal source per live peer, keyed by peer id.
    sources: DashMap<String, Arc<dyn ReplicationSource>>,
    /// WALs each normal source still has to ship: queue -> group -> names.
    wals_by_id: Mutex<WalIndex>,
    /// Recovered sources claimed from dead nodes, plus their WAL index.
    recovered: Mutex<RecoveredSources>,
    /// Per log group, the most recent WAL path rolled on this node. Seeds
    /// newly added peers.
    latest_paths: Mutex<HashMap<String, PathBuf>>,

    storage: Arc<dyn QueueStorage>,
    peers: Arc<ReplicationPeers>,
    server: Arc<dyn Server>,
    factory: Arc<dyn SourceFactory>,
    fs: Arc<dyn WalFs>,
    sync_peer_mapping: SyncPeerMapping,
    executor: FailoverExecutor,
    global_metrics: Arc<GlobalSourceMetrics>,
    stop: StopSignal,

    /// Bytes of batched edits held in memory across all sources. Signed so
    /// an accounting imbalance shows up as a negative value instead of a
    /// wraparound.
    total_buffer_used: AtomicI64,
    total_buffer_limit: u64,

    sleep_before_failover: Duration,
    sleep_for_retries: Duration,
    max_retries_multiplier: u32,
    bulkload_enabled: bool,

    log_dir: PathBuf,
    old_log_dir: PathBuf,
}

impl ReplicationSourceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        peers: Arc<ReplicationPeers>,
        server: Arc<dyn Server>,
        factory: Arc<dyn SourceFactory>,
        fs: Arc<dyn WalFs>,
        config: &ReplicationConfig,
        log_dir: PathBuf,
        old_log_dir: PathBuf,
    ) -> OspreyResult<Self> {
        config.validate()?;
        Ok(Self {
            sources: DashMap::new(),
            wals_by_id: Mutex::new(WalIndex::default()),
            recovered: Mutex::new(RecoveredSources::default()),
            latest_paths: Mutex::new(HashMap::new()),
            storage,
            peers,
            server,
            factory,
            fs,
            sync_peer_mapping: SyncPeerMapping::default(),
            executor: FailoverExecutor::new(config.executor_workers)?,
            global_metrics: Arc::new(GlobalSourceMetrics::default()),
            stop: StopSignal::new(),
            total_buffer_used: AtomicI64::new(0),
            total_buffer_limit: config.total_buffer_limit_bytes,
            sleep_before_failover: config.sleep_before_failover(),
            sleep_for_retries: config.sync_sleep_for_retries(),
            max_retries_multiplier: config.sync_max_retries_multiplier,
            bulkload_enabled: config.bulkload_enabled,
            log_dir,
            old_log_dir,
        })
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    /// Add a normal source for every peer already registered on this node.
    pub fn init(&self) -> OspreyResult<()> {
        for peer_id in self.peers.peer_ids() {
            self.add_source(&peer_id)?;
            if self.bulkload_enabled {
                // The peer may predate bulk-load replication being enabled.
                self.storage.add_peer_to_hfile_refs(&peer_id)?;
            }
        }
        Ok(())
    }

    /// Activate `peer_id` on this node and start shipping to it. A peer that
    /// is already active is a no-op.
    pub fn add_peer(&self, peer_id: &str) -> OspreyResult<()> {
        let added = self
            .peers
            .add_peer(peer_id)
            .ok_or_else(|| ReplicationError::PeerNotFound(peer_id.to_string()))?;
        if added {
            self.add_source(peer_id)?;
            if self.bulkload_enabled {
                self.storage.add_peer_to_hfile_refs(peer_id)?;
            }
        }
        Ok(())
    }

    /// Tear down everything belonging to `peer_id`: recovered sources first,
    /// then the normal source, the sync-replication mapping, and the
    /// bulk-load refs.
    pub fn remove_peer(&self, peer_id: &str) {
        let peer = self.peers.remove_peer(peer_id);
        let terminate_message = "Replication stream was removed by a user";

        let mut removed_recovered = 0usize;
        {
            let mut recovered = self.recovered.lock();
            let to_delete: Vec<_> = recovered
                .list
                .iter()
                .filter(|src| src.peer_id() == peer_id)
                .cloned()
                .collect();
            for src in &to_delete {
                src.terminate(terminate_message, true);
                self.remove_recovered_source_locked(&mut recovered, src);
                removed_recovered += 1;
            }
        }
        info!(
            peer = peer_id,
            count = removed_recovered,
            "deleted recovered sources for peer"
        );

        match self.get_source(peer_id) {
            Some(src) => {
                src.terminate(terminate_message, true);
                self.remove_source(&src);
            }
            None => {
                // Startup race: the peer was removed before its source was
                // ever created. The queue id of a normal source is the peer
                // id, so storage and the index can be cleaned directly.
                let queue_id = QueueId::normal(peer_id);
                self.delete_queue(&queue_id);
                self.wals_by_id.lock().remove_queue(&queue_id);
            }
        }

        if let Some(peer) = peer {
            let config = peer.config();
            if config.is_sync_replication() {
                self.sync_peer_mapping.remove(peer_id, &config);
            }
        }

        self.abort_when_fail(self.storage.remove_peer_from_hfile_refs(peer_id));
    }

    /// Create, seed, register, and start the normal source for `peer_id`.
    ///
    /// Seeding hands the source the newest WAL of every log group so it has
    /// a starting point; the latest-path lock is held throughout so a
    /// concurrent roll cannot open a gap between the seed and the first
    /// `enqueue_log`.
    pub fn add_source(&self, peer_id: &str) -> OspreyResult<()> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::PeerNotFound(peer_id.to_string()))?;
        if peer.config().endpoint == LEGACY_REGION_REPLICATION_ENDPOINT {
            // Region replication no longer runs through this pipeline.
            info!(peer = peer_id, "legacy region replication peer found, skip adding");
            return Ok(());
        }
        let src = self
            .factory
            .create(QueueId::normal(peer_id), Arc::clone(&peer))?;
        {
            let latest_paths = self.latest_paths.lock();
            self.sources.insert(peer_id.to_string(), Arc::clone(&src));
            let mut wals = self.wals_by_id.lock();
            wals.init_queue(src.queue_id().clone());
            for path in latest_paths.values() {
                let name = wal_name(path).ok_or_else(|| {
                    OspreyError::Internal(format!("non UTF-8 wal path {}", path.display()))
                })?;
                wals.insert(src.queue_id(), name);
                // Abort the node and fail the peer add: a seeded wal that is
                // missing from storage would be unaccounted for after a
                // restart.
                self.abort_and_throw_when_fail(self.storage.add_wal(
                    self.server.server_name(),
                    src.queue_id(),
                    name,
                ))?;
                src.enqueue_log(path);
                trace!(wal = name, queue = %src.queue_id(), "enqueued wal during source creation");
            }
        }
        let config = peer.config();
        if config.is_sync_replication() {
            self.sync_peer_mapping.add(peer_id, &config);
        }
        src.startup();
        Ok(())
    }

    /// Replace the sources of `peer_id` after a peer config or state change.
    /// Queue storage is untouched; the replacements are re-enqueued from the
    /// in-memory index, and the statistics of the normal source carry over.
    pub fn refresh_sources(&self, peer_id: &str) -> OspreyResult<()> {
        let terminate_message = format!(
            "Peer {peer_id} state or config changed. Will close the previous \
             replication source and open a new one"
        );
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::PeerNotFound(peer_id.to_string()))?;
        let src;
        {
            let _latest_paths = self.latest_paths.lock();
            if let Some((_, to_remove)) = self.sources.remove(peer_id) {
                info!(peer = peer_id, "terminate replication source");
                // Do not clear metrics.
                to_remove.terminate(&terminate_message, false);
            }
            src = self
                .factory
                .create(QueueId::normal(peer_id), Arc::clone(&peer))?;
            self.sources.insert(peer_id.to_string(), Arc::clone(&src));
            let wals = self.wals_by_id.lock();
            if let Some(groups) = wals.groups(src.queue_id()) {
                for group in groups.values() {
                    for wal in group {
                        src.enqueue_log(&self.log_dir.join(wal));
                    }
                }
            }
        }
        info!(peer = peer_id, "startup replication source");
        src.startup();

        let mut to_startup = Vec::new();
        {
            let mut recovered = self.recovered.lock();
            let mut previous_queue_ids = Vec::new();
            recovered.list.retain(|old| {
                if old.peer_id() == peer_id {
                    previous_queue_ids.push(old.queue_id().clone());
                    old.terminate(&terminate_message, true);
                    false
                } else {
                    true
                }
            });
            for queue_id in previous_queue_ids {
                let replacement = self
                    .factory
                    .create(queue_id.clone(), Arc::clone(&peer))?;
                recovered.list.push(Arc::clone(&replacement));
                if let Some(groups) = recovered.wals.groups(&queue_id) {
                    for group in groups.values() {
                        for wal in group {
                            replacement.enqueue_log(&self.old_log_dir.join(wal));
                        }
                    }
                }
                to_startup.push(replacement);
            }
        }
        for source in to_startup {
            source.startup();
        }
        Ok(())
    }

    /// Drop all pending WALs of a sync-replication peer transitioning to
    /// STANDBY. Without this, transitioning back to DOWNGRADE_ACTIVE later
    /// would re-replicate stale data.
    pub fn drain_sources(&self, peer_id: &str) -> OspreyResult<()> {
        let terminate_message = format!(
            "Sync replication peer {peer_id} is transiting to STANDBY. Will \
             close the previous replication source and open a new one"
        );
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| ReplicationError::PeerNotFound(peer_id.to_string()))?;
        debug_assert!(peer.config().is_sync_replication());
        let src = self
            .factory
            .create(QueueId::normal(peer_id), Arc::clone(&peer))?;

        // Copy the remaining wal files under the latest-path lock, so no
        // concurrent roll can add a name that would escape the deletion
        // below, then delete from storage after releasing it. Removing the
        // index entries only after storage has them deleted keeps a retry
        // possible when a deletion fails halfway.
        let queue_id = QueueId::normal(peer_id);
        let wals_snapshot: HashMap<String, BTreeSet<String>>;
        {
            let _latest_paths = self.latest_paths.lock();
            if let Some(to_remove) = self.sources.insert(peer_id.to_string(), Arc::clone(&src)) {
                info!(peer = peer_id, "terminate replication source");
                to_remove.terminate(&terminate_message, true);
            }
            let wals = self.wals_by_id.lock();
            wals_snapshot = wals
                .groups(&queue_id)
                .map(|groups| {
                    groups
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default();
        }
        info!(peer = peer_id, "startup replication source");
        src.startup();
        for group in wals_snapshot.values() {
            for wal in group {
                self.storage
                    .remove_wal(self.server.server_name(), &queue_id, wal)?;
            }
        }
        {
            let mut wals = self.wals_by_id.lock();
            for (prefix, group) in &wals_snapshot {
                wals.subtract(&queue_id, prefix, group);
            }
        }

        // Recovered queues of a STANDBY peer are dropped wholesale. Storage
        // is deleted under the recovered lock: this is a rare background
        // path and holding the lock keeps the race with claim_queue simple.
        {
            let mut recovered = self.recovered.lock();
            let drained: Vec<_> = recovered
                .list
                .iter()
                .filter(|old| old.peer_id() == peer_id)
                .cloned()
                .collect();
            for old in drained {
                let old_queue_id = old.queue_id().clone();
                old.terminate(&terminate_message, true);
                self.storage
                    .remove_queue(self.server.server_name(), &old_queue_id)?;
                recovered.wals.remove_queue(&old_queue_id);
                recovered.list.retain(|s| !Arc::ptr_eq(s, &old));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Source registry maintenance
    // -----------------------------------------------------------------------

    /// Drop a terminated normal source and its queue. The caller must have
    /// terminated it already.
    pub(crate) fn remove_source(&self, src: &Arc<dyn ReplicationSource>) {
        info!(queue = %src.queue_id(), "done with the queue");
        self.sources.remove(src.peer_id());
        self.delete_queue(src.queue_id());
        self.wals_by_id.lock().remove_queue(src.queue_id());
    }

    /// Remove a terminated recovered source while holding the recovered
    /// lock. Returns false when the source is no longer registered.
    fn remove_recovered_source_locked(
        &self,
        recovered: &mut RecoveredSources,
        src: &Arc<dyn ReplicationSource>,
    ) -> bool {
        let Some(idx) = recovered.list.iter().position(|s| Arc::ptr_eq(s, src)) else {
            return false;
        };
        recovered.list.remove(idx);
        info!(queue = %src.queue_id(), "done with the recovered queue");
        self.delete_queue(src.queue_id());
        recovered.wals.remove_queue(src.queue_id());
        true
    }

    /// Called by a recovered source that has fully drained its queue.
    pub fn finish_recovered_source(&self, src: &Arc<dyn ReplicationSource>) {
        {
            let mut recovered = self.recovered.lock();
            if !self.remove_recovered_source_locked(&mut recovered, src) {
                return;
            }
        }
        info!(
            queue = %src.queue_id(),
            stats = %src.stats(),
            "finished recovering queue"
        );
    }

    /// Delete a whole queue from storage, aborting the node on failure.
    fn delete_queue(&self, queue_id: &QueueId) {
        self.abort_when_fail(
            self.storage
                .remove_queue(self.server.server_name(), queue_id),
        );
    }

    // -----------------------------------------------------------------------
    // Log roll
    // -----------------------------------------------------------------------

    /// Called before the WAL subsystem closes the previous log. Registers
    /// the new WAL in storage for every live source and in the in-memory
    /// index, then publishes it as the group's latest path. A storage
    /// failure aborts the node *and* fails the roll, since otherwise the
    /// WAL would carry records unaccounted for in storage.
    pub fn pre_log_roll(&self, new_log: &Path) -> OspreyResult<()> {
        let log_name = wal_name(new_log)
            .ok_or_else(|| {
                OspreyError::Internal(format!("non UTF-8 wal path {}", new_log.display()))
            })?
            .to_string();
        let log_prefix = wal_prefix(&log_name).to_string();

        let mut latest_paths = self.latest_paths.lock();
        for entry in self.sources.iter() {
            self.abort_and_throw_when_fail(self.storage.add_wal(
                self.server.server_name(),
                entry.value().queue_id(),
                &log_name,
            ))?;
        }
        {
            let mut wals = self.wals_by_id.lock();
            // With no live source there is no consumer for the history:
            // existing group contents are dropped and only the new name is
            // kept for seeding a future peer.
            wals.record_roll(&log_name, self.sources.is_empty());
        }
        latest_paths.insert(log_prefix, new_log.to_path_buf());
        Ok(())
    }

    /// Called after the previous log is closed: hand the new WAL to every
    /// live normal source. Recovered sources replay a fixed claimed set and
    /// are not notified.
    pub fn post_log_roll(&self, new_log: &Path) {
        for entry in self.sources.iter() {
            entry.value().enqueue_log(new_log);
            trace!(
                wal = %new_log.display(),
                queue = %entry.value().queue_id(),
                "enqueued wal on log roll"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Shipping progress and cleanup
    // -----------------------------------------------------------------------

    /// Record how far `source` has shipped and prune WALs that are fully
    /// replicated. Returns [`ReplicationError::Cancelled`] (wrapped) when
    /// the underlying storage call was interrupted by a concurrent source
    /// termination: the shipper loop exits cleanly on it instead of taking
    /// the node down.
    pub fn log_position_and_clean_old_logs(
        &self,
        source: &Arc<dyn ReplicationSource>,
        batch: &WalEntryBatch,
    ) -> OspreyResult<()> {
        let file_name = batch.last_wal_name().ok_or_else(|| {
            OspreyError::Internal(format!(
                "non UTF-8 wal path {}",
                batch.last_wal_path.display()
            ))
        })?;
        self.interrupt_or_abort_when_fail(self.storage.set_wal_position(
            self.server.server_name(),
            source.queue_id(),
            file_name,
            batch.last_wal_position,
            batch.last_seq_ids.clone(),
        ))?;
        self.clean_old_logs(file_name, batch.end_of_file, source)
    }

    /// Remove `log` (when `inclusive`) and everything older in its group
    /// from memory and storage. Called once a source is sure the files have
    /// no entries left to ship.
    pub(crate) fn clean_old_logs(
        &self,
        log: &str,
        inclusive: bool,
        source: &Arc<dyn ReplicationSource>,
    ) -> OspreyResult<()> {
        let log_prefix = wal_prefix(log).to_string();
        if source.is_recovered() {
            let to_remove = {
                let recovered = self.recovered.lock();
                recovered.wals.head_set(source.queue_id(), log, inclusive)
            };
            if to_remove.is_empty() {
                return Ok(());
            }
            self.prune_wals(&to_remove, source)?;
            let mut recovered = self.recovered.lock();
            recovered
                .wals
                .subtract(source.queue_id(), &log_prefix, &to_remove);
        } else {
            let to_remove = {
                let wals = self.wals_by_id.lock();
                wals.head_set(source.queue_id(), log, inclusive)
            };
            if to_remove.is_empty() {
                return Ok(());
            }
            // Deleting may take a while, in particular the remote wals of a
            // sync replication peer, so it must not hold the lock and block
            // a concurrent pre_log_roll.
            self.prune_wals(&to_remove, source)?;
            let mut wals = self.wals_by_id.lock();
            wals.subtract(source.queue_id(), &log_prefix, &to_remove);
        }
        Ok(())
    }

    /// Delete a batch of fully-shipped WALs: remote copies first for a sync
    /// peer, then the storage entries.
    fn prune_wals(
        &self,
        wals: &BTreeSet<String>,
        source: &Arc<dyn ReplicationSource>,
    ) -> OspreyResult<()> {
        debug!(count = wals.len(), wals = ?wals, "removing logs from the queue");
        if source.is_sync_replication() && !self.remove_remote_wals_with_retry(wals, source) {
            // Remote cleanup was abandoned because the source was
            // terminated; leave storage untouched too.
            return Ok(());
        }
        for wal in wals {
            self.interrupt_or_abort_when_fail(self.storage.remove_wal(
                self.server.server_name(),
                source.queue_id(),
                wal,
            ))?;
        }
        Ok(())
    }

    /// Delete the remote copies of sync-replication WALs, retrying forever
    /// while the source stays active. Returns false when the cleanup was
    /// abandoned because the source was terminated.
    ///
    /// Replication cannot proceed past these files, so blocking here does
    /// not make availability worse; a stale remote WAL, however, would be
    /// replayed after a role transition and corrupt the standby.
    fn remove_remote_wals_with_retry(
        &self,
        wals: &BTreeSet<String>,
        source: &Arc<dyn ReplicationSource>,
    ) -> bool {
        let peer_id = source.peer_id();
        // Only names that embed this peer's id live in the remote directory.
        let remote_wals: Vec<&str> = wals
            .iter()
            .filter(|wal| sync_replication_peer_id(wal) == Some(peer_id))
            .map(String::as_str)
            .collect();
        if remote_wals.is_empty() {
            return true;
        }
        let Some(remote_dir) = source.peer().config().remote_wal_dir else {
            warn!(peer = peer_id, "sync replication peer has no remote wal dir configured");
            return true;
        };
        let remote_dir_for_peer = remote_dir.join(peer_id);
        debug!(
            count = remote_wals.len(),
            dir = %remote_dir_for_peer.display(),
            "removing remote logs"
        );
        let mut sleep_multiplier: u32 = 0;
        loop {
            match self.remove_remote_wals(&remote_dir_for_peer, &remote_wals) {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        peer = peer_id,
                        dir = %remote_dir_for_peer.display(),
                        error = %e,
                        "failed to delete remote wals"
                    );
                }
            }
            if !source.is_active() {
                // The source was terminated between retries; whoever owns
                // the queue next redoes this cleanup.
                return false;
            }
            if self.sleep_for_retries("failed to delete remote wals", sleep_multiplier) {
                sleep_multiplier += 1;
            }
        }
    }

    fn remove_remote_wals(&self, dir: &Path, wals: &[&str]) -> std::io::Result<()> {
        for wal in wals {
            let wal_file = dir.join(wal);
            match self.fs.delete(&wal_file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Already gone, which is what we wanted.
                    debug!(file = %wal_file.display(), "remote wal already deleted");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop-aware backoff sleep of `base * multiplier`. Returns whether the
    /// multiplier may still grow.
    fn sleep_for_retries(&self, reason: &str, multiplier: u32) -> bool {
        trace!(
            reason,
            sleep_ms = self.sleep_for_retries.as_millis() as u64 * multiplier as u64,
            "backing off"
        );
        self.stop.wait(self.sleep_for_retries * multiplier);
        multiplier < self.max_retries_multiplier
    }

    // -----------------------------------------------------------------------
    // Failover
    // -----------------------------------------------------------------------

    /// Adopt one queue of a dead node. Invoked by the cluster's node-death
    /// watcher; the actual claim runs on the failover worker pool.
    pub fn claim_queue(self: &Arc<Self>, dead_server: ServerName, queue: QueueId) {
        let manager = Arc::clone(self);
        let submitted = self.executor.submit(Box::new(move || {
            manager.run_claim_queue(dead_server, queue);
        }));
        if !submitted {
            info!("not claiming queue, failover executor is shut down");
        }
    }

    fn run_claim_queue(&self, dead_server: ServerName, queue: QueueId) {
        // Smear concurrent claimants; this node may also be shutting down,
        // in which case another node picks the queue up.
        let jitter = self
            .sleep_before_failover
            .mul_f64(1.0 + jitter_fraction());
        self.stop.wait(jitter);
        if self.server.is_stopped() || self.stop.is_stopped() {
            info!("not transferring queue since we are shutting down");
            return;
        }

        let peer_id = queue.peer_id().to_string();
        // A copy of the peer handle from *before* the claim: if the peer is
        // removed and re-added meanwhile, the handle changes identity and
        // the claimed queue must not be resurrected for the new incarnation.
        let Some(old_peer) = self.peers.get(&peer_id) else {
            info!(
                peer = %peer_id,
                queue = %queue,
                "not transferring queue, replication peer does not exist"
            );
            return;
        };

        let claimed = self
            .storage
            .claim_queue(&dead_server, &queue, self.server.server_name());
        let (queue_id, wal_set) = match claimed {
            Ok(pair) => pair,
            Err(e) => {
                error!(
                    dead_server = %dead_server,
                    queue = %queue,
                    error = %e,
                    "cannot claim replication queue of dead node"
                );
                self.server
                    .abort("Failed to claim queue from dead node", Some(&e));
                return;
            }
        };
        if wal_set.is_empty() {
            return;
        }

        let peer = self.peers.get(&peer_id);
        if !peer
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &old_peer))
        {
            warn!(peer = %peer_id, dead_server = %dead_server, "skipping failover, peer is gone");
            self.abort_when_fail(
                self.storage
                    .remove_queue(self.server.server_name(), &queue_id),
            );
            return;
        }
        let peer = old_peer;

        if self.server.is_sync_up_host() && !peer.is_enabled() {
            warn!(
                peer = %peer_id,
                "peer is disabled, sync-up tool will skip replicating data to it"
            );
            return;
        }

        let src = match self.factory.create(queue_id.clone(), Arc::clone(&peer)) {
            Ok(src) => src,
            Err(e) => {
                error!(
                    peer = %peer_id,
                    queue = %queue_id,
                    error = %e,
                    "cannot create replication source for claimed queue"
                );
                self.server
                    .abort("Failed to create replication source after claiming queue", None);
                return;
            }
        };

        let mut recovered = self.recovered.lock();
        // Re-check under the lock: remove_peer terminates recovered sources
        // while holding it, so a source installed after this check is
        // guaranteed to be seen by any later removal.
        let current = self.peers.get(src.peer_id());
        if !current
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &peer))
        {
            src.terminate("Recovered queue doesn't belong to any current peer", true);
            self.delete_queue(&queue_id);
            return;
        }
        // A sync replication peer in (or moving to) STANDBY must not drain
        // claimed queues; the one exception is STANDBY -> DOWNGRADE_ACTIVE,
        // where the replayed remote wals need to be replicated back.
        if peer.is_sync_replication() {
            let (state, new_state) = peer.sync_state_and_new_state();
            let standby_with_no_transition =
                state == SyncReplicationState::Standby && new_state == SyncReplicationState::None;
            if standby_with_no_transition || new_state == SyncReplicationState::Standby {
                src.terminate("Sync replication peer is in STANDBY state", true);
                self.delete_queue(&queue_id);
                return;
            }
        }

        recovered.wals.init_queue(queue_id.clone());
        for wal in &wal_set {
            recovered.wals.insert(&queue_id, wal);
        }
        recovered.list.push(Arc::clone(&src));
        info!(queue = %queue_id, "added source for recovered queue");
        for wal in &wal_set {
            trace!(queue = %queue_id, wal = %wal, "enqueueing log from recovered queue");
            src.enqueue_log(&self.old_log_dir.join(wal));
        }
        src.startup();
    }

    /// In-flight failover claims (queued or running).
    pub fn active_failover_task_count(&self) -> usize {
        self.executor.in_flight()
    }

    // -----------------------------------------------------------------------
    // Buffer quota
    // -----------------------------------------------------------------------

    /// Charge `entry`'s size to `batch` and the global quota. True means the
    /// quota is exhausted: the caller should stop reading and ship what it
    /// has.
    pub fn acquire_wal_entry_buffer_quota(&self, batch: &WalEntryBatch, entry: &WalEntry) -> bool {
        let entry_size = batch.increment_used_buffer_size(entry);
        self.acquire_buffer_quota(entry_size)
    }

    /// Release everything `batch` charged. Returns the released size.
    pub fn release_wal_entry_batch_buffer_quota(&self, batch: &WalEntryBatch) -> u64 {
        let used = batch.used_buffer_size();
        if used > 0 {
            self.release_buffer_quota(used);
        }
        used
    }

    /// Add `size` to the global counter. True iff the counter is now at or
    /// over the limit.
    pub fn acquire_buffer_quota(&self, size: u64) -> bool {
        let new_buffer_used = self.add_total_buffer_used(size as i64);
        new_buffer_used >= self.total_buffer_limit as i64
    }

    pub fn release_buffer_quota(&self, size: u64) {
        self.add_total_buffer_used(-(size as i64));
    }

    fn add_total_buffer_used(&self, delta: i64) -> i64 {
        if delta == 0 {
            return self.total_buffer_used.load(Ordering::SeqCst);
        }
        let new_buffer_used = self.total_buffer_used.fetch_add(delta, Ordering::SeqCst) + delta;
        self.global_metrics
            .set_wal_reader_edits_buffer_bytes(new_buffer_used);
        new_buffer_used
    }

    /// Advisory read for sources before they read more edits: false when
    /// the global quota is already exceeded.
    pub fn check_buffer_quota(&self, peer_id: &str) -> bool {
        let used = self.total_buffer_used.load(Ordering::SeqCst);
        if used > self.total_buffer_limit as i64 {
            warn!(
                peer = peer_id,
                used_bytes = used,
                limit_bytes = self.total_buffer_limit,
                "cannot read more edits from wal, buffer usage exceeds limit"
            );
            return false;
        }
        true
    }

    // -----------------------------------------------------------------------
    // Bulk load refs
    // -----------------------------------------------------------------------

    /// Forward newly bulk-loaded file references to every peer.
    pub fn add_hfile_refs(
        &self,
        table: &str,
        family: &[u8],
        pairs: &[(PathBuf, PathBuf)],
    ) -> OspreyResult<()> {
        for entry in self.sources.iter() {
            entry.value().add_hfile_refs(table, family, pairs)?;
        }
        Ok(())
    }

    /// Drop file references a peer has fully replicated. Like position
    /// logging, tolerates being cancelled by a concurrent source
    /// termination.
    pub fn clean_up_hfile_refs(&self, peer_id: &str, files: &[String]) -> OspreyResult<()> {
        self.interrupt_or_abort_when_fail(self.storage.remove_hfile_refs(peer_id, files))
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Terminate replication on this node. Durable queues are left in place
    /// for another node to claim.
    pub fn join(&self) {
        self.stop.stop();
        self.executor.shutdown();
        for entry in self.sources.iter() {
            entry.value().terminate("Node is closing", true);
        }
        let recovered = self.recovered.lock();
        for source in &recovered.list {
            source.terminate("Node is closing", true);
        }
    }

    // -----------------------------------------------------------------------
    // Error policies
    // -----------------------------------------------------------------------
    //
    // Every storage mutation goes through one of these, chosen per call site
    // by who can handle the failure:
    //   - plain `?`                    the caller can surface it (peer ops)
    //   - abort_when_fail              nobody can; divergence is fatal
    //   - interrupt_or_abort_when_fail like abort, except a cancelled call
    //                                  from a terminated source unwinds the
    //                                  shipper instead
    //   - abort_and_throw_when_fail    fatal, and the caller must also fail
    //                                  (log roll)

    fn abort_when_fail(&self, result: Result<(), ReplicationError>) {
        if let Err(e) = result {
            self.server
                .abort("Failed to operate on replication queue", Some(&e));
        }
    }

    fn interrupt_or_abort_when_fail(
        &self,
        result: Result<(), ReplicationError>,
    ) -> OspreyResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(ReplicationError::Cancelled) => Err(ReplicationError::Cancelled.into()),
            Err(e) => {
                self.server
                    .abort("Failed to operate on replication queue", Some(&e));
                Ok(())
            }
        }
    }

    fn abort_and_throw_when_fail(
        &self,
        result: Result<(), ReplicationError>,
    ) -> OspreyResult<()> {
        if let Err(e) = result {
            self.server
                .abort("Failed to operate on replication queue", Some(&e));
            return Err(e.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Copy of the normal-source WAL index.
    pub fn get_wals(&self) -> HashMap<QueueId, HashMap<String, BTreeSet<String>>> {
        self.wals_by_id.lock().snapshot()
    }

    /// Copy of the recovered-source WAL index.
    pub fn get_wals_by_id_recovered_queues(
        &self,
    ) -> HashMap<QueueId, HashMap<String, BTreeSet<String>>> {
        self.recovered.lock().wals.snapshot()
    }

    pub fn get_sources(&self) -> Vec<Arc<dyn ReplicationSource>> {
        self.sources
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get_old_sources(&self) -> Vec<Arc<dyn ReplicationSource>> {
        self.recovered.lock().list.clone()
    }

    pub fn get_source(&self, peer_id: &str) -> Option<Arc<dyn ReplicationSource>> {
        self.sources.get(peer_id).map(|r| Arc::clone(r.value()))
    }

    /// Queue ids this node owns in durable storage.
    pub fn get_all_queues(&self) -> OspreyResult<Vec<QueueId>> {
        Ok(self.storage.get_all_queues(self.server.server_name())?)
    }

    pub fn get_size_of_latest_path(&self) -> usize {
        self.latest_paths.lock().len()
    }

    pub fn get_latest_paths(&self) -> HashMap<String, PathBuf> {
        self.latest_paths.lock().clone()
    }

    pub fn get_total_buffer_used(&self) -> i64 {
        self.total_buffer_used.load(Ordering::SeqCst)
    }

    /// Maximum bytes of edits held in memory pending replication across all
    /// sources on this node.
    pub fn get_total_buffer_limit(&self) -> u64 {
        self.total_buffer_limit
    }

    pub fn get_old_log_dir(&self) -> &Path {
        &self.old_log_dir
    }

    pub fn get_log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn get_fs(&self) -> &Arc<dyn WalFs> {
        &self.fs
    }

    pub fn get_replication_peers(&self) -> &Arc<ReplicationPeers> {
        &self.peers
    }

    pub fn get_queue_storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    pub fn get_global_metrics(&self) -> &Arc<GlobalSourceMetrics> {
        &self.global_metrics
    }

    /// Human-readable statistics of every source on this node.
    pub fn get_stats(&self) -> String {
        let mut stats = String::new();
        let _ = writeln!(
            stats,
            "Global stats: WAL Edits Buffer Used={}B, Limit={}B",
            self.get_total_buffer_used(),
            self.get_total_buffer_limit()
        );
        for entry in self.sources.iter() {
            let source = entry.value();
            let _ = writeln!(
                stats,
                "Normal source for peer {}: {}",
                source.peer_id(),
                source.stats()
            );
        }
        for source in self.get_old_sources() {
            let _ = writeln!(
                stats,
                "Recovered source for peer {} (queue {}): {}",
                source.peer_id(),
                source.queue_id(),
                source.stats()
            );
        }
        stats
    }
}
