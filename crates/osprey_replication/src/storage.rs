//! Durable replication queue storage.
//!
//! The store is a transactional registry of
//! `node -> queue id -> ordered WAL names`, with a byte position and
//! last-shipped sequence ids per WAL, plus the bulk-load file reference
//! sections. The source manager treats it as the ground truth: the in-memory
//! WAL index must never diverge from it past the brief windows the manager
//! holds its locks for.
//!
//! [`MemoryQueueStorage`] is the in-process implementation used by embedded
//! deployments and tests, in the same spirit as the in-process transports
//! elsewhere in OspreyDB.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

use osprey_common::error::ReplicationError;
use osprey_common::types::ServerName;

use crate::queue::QueueId;

pub type StorageResult<T> = Result<T, ReplicationError>;

/// Shipping progress recorded for one WAL of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalProgress {
    /// Byte offset the source has fully shipped up to.
    pub position: u64,
    /// Highest shipped sequence id per region, keyed by encoded region name.
    pub last_seq_ids: BTreeMap<String, u64>,
}

/// Transactional registry of replication queues.
///
/// Implementations must make [`QueueStorage::claim_queue`] atomic across the
/// cluster: exactly one claimant wins a dead node's queue. A call that fails
/// because the issuing source was terminated mid-operation must surface
/// [`ReplicationError::Cancelled`]; everything else is a `Store` failure.
pub trait QueueStorage: Send + Sync {
    /// Register `wal` under `(server, queue)`.
    fn add_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()>;

    /// Drop `wal` from `(server, queue)`. Unknown names are a no-op.
    fn remove_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()>;

    /// Persist shipping progress for `wal`.
    fn set_wal_position(
        &self,
        server: &ServerName,
        queue: &QueueId,
        wal: &str,
        position: u64,
        last_seq_ids: HashMap<String, u64>,
    ) -> StorageResult<()>;

    /// Delete a whole queue with all its WAL entries.
    fn remove_queue(&self, server: &ServerName, queue: &QueueId) -> StorageResult<()>;

    /// All queue ids owned by `server`.
    fn get_all_queues(&self, server: &ServerName) -> StorageResult<Vec<QueueId>>;

    /// Atomically move `(dead_server, queue)` to `target`, returning the new
    /// queue id and the ordered WAL set that came with it. Claiming a queue
    /// that no longer exists yields an empty set.
    fn claim_queue(
        &self,
        dead_server: &ServerName,
        queue: &QueueId,
        target: &ServerName,
    ) -> StorageResult<(QueueId, BTreeSet<String>)>;

    fn add_peer_to_hfile_refs(&self, peer_id: &str) -> StorageResult<()>;

    fn remove_peer_from_hfile_refs(&self, peer_id: &str) -> StorageResult<()>;

    /// Drop replicated bulk-load file references for `peer_id`.
    fn remove_hfile_refs(&self, peer_id: &str, files: &[String]) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// MemoryQueueStorage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueData {
    wals: BTreeMap<String, WalProgress>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<ServerName, HashMap<QueueId, QueueData>>,
    hfile_refs: HashMap<String, BTreeSet<String>>,
}

/// In-process `QueueStorage` backed by a single mutex, which trivially gives
/// the claim its atomicity.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    inner: Mutex<Inner>,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// WAL names currently registered under `(server, queue)`, in order.
    pub fn wals(&self, server: &ServerName, queue: &QueueId) -> Vec<String> {
        self.inner
            .lock()
            .queues
            .get(server)
            .and_then(|qs| qs.get(queue))
            .map(|q| q.wals.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_queue(&self, server: &ServerName, queue: &QueueId) -> bool {
        self.inner
            .lock()
            .queues
            .get(server)
            .is_some_and(|qs| qs.contains_key(queue))
    }

    pub fn wal_progress(
        &self,
        server: &ServerName,
        queue: &QueueId,
        wal: &str,
    ) -> Option<WalProgress> {
        self.inner
            .lock()
            .queues
            .get(server)
            .and_then(|qs| qs.get(queue))
            .and_then(|q| q.wals.get(wal))
            .cloned()
    }

    pub fn hfile_ref_peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.inner.lock().hfile_refs.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn hfile_refs(&self, peer_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .hfile_refs
            .get(peer_id)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Test hook: register bulk-load file references for a peer.
    pub fn insert_hfile_refs(&self, peer_id: &str, files: impl IntoIterator<Item = String>) {
        self.inner
            .lock()
            .hfile_refs
            .entry(peer_id.to_string())
            .or_default()
            .extend(files);
    }
}

impl QueueStorage for MemoryQueueStorage {
    fn add_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner
            .queues
            .entry(server.clone())
            .or_default()
            .entry(queue.clone())
            .or_default()
            .wals
            .entry(wal.to_string())
            .or_default();
        Ok(())
    }

    fn remove_wal(&self, server: &ServerName, queue: &QueueId, wal: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(data) = inner
            .queues
            .get_mut(server)
            .and_then(|qs| qs.get_mut(queue))
        {
            data.wals.remove(wal);
        }
        Ok(())
    }

    fn set_wal_position(
        &self,
        server: &ServerName,
        queue: &QueueId,
        wal: &str,
        position: u64,
        last_seq_ids: HashMap<String, u64>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .queues
            .entry(server.clone())
            .or_default()
            .entry(queue.clone())
            .or_default()
            .wals
            .entry(wal.to_string())
            .or_default();
        entry.position = position;
        entry.last_seq_ids = last_seq_ids.into_iter().collect();
        Ok(())
    }

    fn remove_queue(&self, server: &ServerName, queue: &QueueId) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(qs) = inner.queues.get_mut(server) {
            qs.remove(queue);
        }
        Ok(())
    }

    fn get_all_queues(&self, server: &ServerName) -> StorageResult<Vec<QueueId>> {
        let inner = self.inner.lock();
        let mut queues: Vec<_> = inner
            .queues
            .get(server)
            .map(|qs| qs.keys().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        Ok(queues)
    }

    fn claim_queue(
        &self,
        dead_server: &ServerName,
        queue: &QueueId,
        target: &ServerName,
    ) -> StorageResult<(QueueId, BTreeSet<String>)> {
        let mut inner = self.inner.lock();
        let claimed_id = queue.claimed_from(dead_server);
        let data = inner
            .queues
            .get_mut(dead_server)
            .and_then(|qs| qs.remove(queue));
        let Some(data) = data else {
            return Ok((claimed_id, BTreeSet::new()));
        };
        let wal_names: BTreeSet<String> = data.wals.keys().cloned().collect();
        inner
            .queues
            .entry(target.clone())
            .or_default()
            .insert(claimed_id.clone(), data);
        Ok((claimed_id, wal_names))
    }

    fn add_peer_to_hfile_refs(&self, peer_id: &str) -> StorageResult<()> {
        self.inner
            .lock()
            .hfile_refs
            .entry(peer_id.to_string())
            .or_default();
        Ok(())
    }

    fn remove_peer_from_hfile_refs(&self, peer_id: &str) -> StorageResult<()> {
        self.inner.lock().hfile_refs.remove(peer_id);
        Ok(())
    }

    fn remove_hfile_refs(&self, peer_id: &str, files: &[String]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(refs) = inner.hfile_refs.get_mut(peer_id) {
            for file in files {
                refs.remove(file);
            }
        }
        Ok(())
    }
}
