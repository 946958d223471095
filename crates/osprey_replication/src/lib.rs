//! Replication source management for OspreyDB nodes.
//!
//! Every node appends edits to write-ahead logs and ships them to remote
//! peer clusters. This crate owns the node-local side of that pipeline:
//!
//! - One persistent *normal* source per peer, fed a new WAL on every roll.
//! - Transient *recovered* sources that drain queues claimed from dead
//!   nodes.
//! - The in-memory WAL index and the durable queue storage it mirrors, so
//!   no WAL is forgotten and none is shipped twice.
//! - A global buffer quota bounding the batched edits all sources hold in
//!   memory.
//!
//! # Architecture
//!
//! ```text
//!   ReplicationSourceManager
//!       |
//!       +-- sources (peer -> normal ReplicationSource)
//!       +-- recovered sources + recovered WalIndex   (one lock)
//!       +-- WalIndex (queue -> log group -> ordered wal names)
//!       +-- latest_paths (log group -> newest wal)   seeds new peers
//!       +-- FailoverExecutor                          claims dead queues
//!       +-- buffer quota (atomic counter vs limit)
//!       |
//!       +-- QueueStorage (durable, transactional claim)
//!       +-- ReplicationPeers / SyncPeerMapping
//!       +-- WalFs (remote wal cleanup for sync peers)
//! ```
//!
//! The shipper internals (reading WALs, batching, pushing to the remote
//! cluster) live behind the [`source::ReplicationSource`] trait.

mod failover;
pub mod manager;
pub mod metrics;
pub mod peer;
pub mod queue;
pub mod source;
pub mod storage;
pub mod wal;

pub use manager::{ReplicationSourceManager, Server};
pub use metrics::{GlobalSourceMetrics, SourceMetrics, SourceMetricsSnapshot};
pub use peer::{
    PeerConfig, PeerState, ReplicationMode, ReplicationPeer, ReplicationPeers, SyncPeerMapping,
    SyncReplicationState, LEGACY_REGION_REPLICATION_ENDPOINT,
};
pub use queue::{QueueId, WalIndex};
pub use source::{ReplicationSource, SourceFactory};
pub use storage::{MemoryQueueStorage, QueueStorage, WalProgress};
pub use wal::{
    sync_replication_peer_id, sync_replication_wal_name, wal_name, wal_prefix, LocalWalFs,
    WalEntry, WalEntryBatch, WalFs, SYNC_REPLICATION_WAL_SUFFIX,
};
