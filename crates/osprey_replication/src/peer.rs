//! Replication peers: configuration, runtime state, and the node-local
//! registry.
//!
//! A peer is a remote cluster that receives this node's edits. The registry
//! mirrors the cluster-wide peer catalog: `add_peer` activates a catalog
//! entry into a live [`ReplicationPeer`] handle. Handles are compared by
//! pointer identity, so a peer removed and re-added under the same id yields
//! a *different* handle, which is how the failover claimer detects that a
//! claimed queue belongs to a previous incarnation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

/// Endpoint implementation name of the retired region-replication peer kind.
/// Sources are never created for peers still configured with it.
pub const LEGACY_REGION_REPLICATION_ENDPOINT: &str = "osprey.legacy.RegionReplicationEndpoint";

/// How edits travel to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Ship batches from archived WALs, acknowledge locally first.
    #[default]
    Async,
    /// Synchronous replication: WALs are also staged on the remote cluster
    /// filesystem and must be cleaned up there once fully shipped.
    Sync,
}

/// Whether a peer currently accepts edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Enabled,
    Disabled,
}

/// State machine of a synchronous-replication peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncReplicationState {
    /// Not participating in a sync-replication pair (also the "no transition
    /// pending" value of the second slot).
    #[default]
    None,
    Active,
    DowngradeActive,
    Standby,
}

impl fmt::Display for SyncReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncReplicationState::None => "NONE",
            SyncReplicationState::Active => "ACTIVE",
            SyncReplicationState::DowngradeActive => "DOWNGRADE_ACTIVE",
            SyncReplicationState::Standby => "STANDBY",
        };
        f.write_str(s)
    }
}

/// Static configuration of a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Endpoint implementation shipping the edits (cluster key or plugin
    /// name).
    pub endpoint: String,
    pub mode: ReplicationMode,
    /// Remote cluster directory holding staged WAL copies. Required for
    /// [`ReplicationMode::Sync`] peers.
    pub remote_wal_dir: Option<PathBuf>,
}

impl PeerConfig {
    pub fn is_sync_replication(&self) -> bool {
        self.mode == ReplicationMode::Sync
    }
}

/// Live handle to an activated peer.
///
/// Identity matters: see the module doc. All mutable state sits behind its
/// own lock so config refreshes, enable/disable, and sync-state transitions
/// never contend with each other.
#[derive(Debug)]
pub struct ReplicationPeer {
    id: String,
    config: RwLock<PeerConfig>,
    state: RwLock<PeerState>,
    /// Current sync-replication state and the state being transitioned to
    /// (`None` when no transition is in flight).
    sync_state: RwLock<(SyncReplicationState, SyncReplicationState)>,
}

impl ReplicationPeer {
    pub fn new(id: impl Into<String>, config: PeerConfig) -> Self {
        let sync_state = if config.is_sync_replication() {
            (SyncReplicationState::DowngradeActive, SyncReplicationState::None)
        } else {
            (SyncReplicationState::None, SyncReplicationState::None)
        };
        Self {
            id: id.into(),
            config: RwLock::new(config),
            state: RwLock::new(PeerState::Enabled),
            sync_state: RwLock::new(sync_state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> PeerConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: PeerConfig) {
        *self.config.write() = config;
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == PeerState::Enabled
    }

    pub fn is_sync_replication(&self) -> bool {
        self.config.read().is_sync_replication()
    }

    /// `(current, transitioning-to)`; the second slot is `None` when no
    /// transition is pending.
    pub fn sync_state_and_new_state(&self) -> (SyncReplicationState, SyncReplicationState) {
        *self.sync_state.read()
    }

    pub fn set_sync_state(&self, current: SyncReplicationState, new: SyncReplicationState) {
        *self.sync_state.write() = (current, new);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Node-local registry of activated peers plus the catalog of known peer
/// definitions the control plane has pushed to this node.
#[derive(Debug, Default)]
pub struct ReplicationPeers {
    definitions: Mutex<std::collections::HashMap<String, PeerConfig>>,
    peers: DashMap<String, Arc<ReplicationPeer>>,
}

impl ReplicationPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a catalog entry. Does not activate the peer.
    pub fn define_peer(&self, peer_id: impl Into<String>, config: PeerConfig) {
        self.definitions.lock().insert(peer_id.into(), config);
    }

    /// Activate a cataloged peer. `Some(false)` when the peer is already
    /// active, `None` when no definition exists for the id.
    pub fn add_peer(&self, peer_id: &str) -> Option<bool> {
        if self.peers.contains_key(peer_id) {
            return Some(false);
        }
        let config = self.definitions.lock().get(peer_id).cloned()?;
        self.peers
            .insert(peer_id.to_string(), Arc::new(ReplicationPeer::new(peer_id, config)));
        Some(true)
    }

    /// Deactivate a peer, returning its final handle.
    pub fn remove_peer(&self, peer_id: &str) -> Option<Arc<ReplicationPeer>> {
        self.peers.remove(peer_id).map(|(_, peer)| peer)
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<ReplicationPeer>> {
        self.peers.get(peer_id).map(|r| Arc::clone(r.value()))
    }

    /// Ids of every active peer.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|r| r.key().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Sync-replication peer mapping
// ---------------------------------------------------------------------------

/// Peer id → remote WAL directory for the sync-replication WAL provider.
/// Maintained by the source manager as sync peers come and go.
#[derive(Debug, Default)]
pub struct SyncPeerMapping {
    by_peer: RwLock<std::collections::HashMap<String, PathBuf>>,
}

impl SyncPeerMapping {
    pub fn add(&self, peer_id: &str, config: &PeerConfig) {
        if let Some(dir) = &config.remote_wal_dir {
            self.by_peer
                .write()
                .insert(peer_id.to_string(), dir.clone());
        }
    }

    pub fn remove(&self, peer_id: &str, _config: &PeerConfig) {
        self.by_peer.write().remove(peer_id);
    }

    pub fn remote_wal_dir(&self, peer_id: &str) -> Option<PathBuf> {
        self.by_peer.read().get(peer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_peer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.read().is_empty()
    }
}
