//! The replication source seam.
//!
//! A source is the long-running shipper bound to one replication queue: it
//! tails the queue's WALs, batches edits, and pushes them to the remote
//! cluster. The shipper internals live elsewhere; the manager drives sources
//! purely through [`ReplicationSource`] and creates them through
//! [`SourceFactory`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use osprey_common::error::{OspreyResult, ReplicationError};

use crate::metrics::SourceMetrics;
use crate::peer::ReplicationPeer;
use crate::queue::QueueId;

/// Capability interface of a running source. Two variants exist: the
/// permanent *normal* source of a live peer, and the transient *recovered*
/// source draining a queue claimed from a dead node; the `is_recovered`
/// discriminator (derived from the queue id) tells them apart.
pub trait ReplicationSource: Send + Sync {
    fn queue_id(&self) -> &QueueId;

    fn peer_id(&self) -> &str {
        self.queue_id().peer_id()
    }

    fn peer(&self) -> &Arc<ReplicationPeer>;

    fn is_recovered(&self) -> bool {
        self.queue_id().is_recovered()
    }

    /// Whether the source is still shipping. Terminated sources return
    /// false, which aborts any cleanup retry loop run on their behalf.
    fn is_active(&self) -> bool;

    fn is_sync_replication(&self) -> bool {
        self.peer().is_sync_replication()
    }

    /// Hand the source a WAL to ship after the one(s) it already owns.
    fn enqueue_log(&self, wal: &Path);

    /// Start the shipper threads. Called exactly once, after the source has
    /// been seeded and registered.
    fn startup(&self);

    /// Stop the shipper. `clear_metrics` is false only when the source is
    /// being swapped out by a config refresh and its statistics must carry
    /// over to the replacement.
    ///
    /// Termination is a signal, not a join: the manager may call this while
    /// holding its recovered-source lock, so implementations must not wait
    /// here for shipper threads that could be blocked inside a manager
    /// callback. In-flight storage calls of a terminated source surface
    /// `Cancelled` and unwind on their own.
    fn terminate(&self, reason: &str, clear_metrics: bool);

    fn metrics(&self) -> &SourceMetrics;

    /// One-line statistics summary for `get_stats`.
    fn stats(&self) -> String;

    /// Forward bulk-load file references to the peer.
    fn add_hfile_refs(
        &self,
        table: &str,
        family: &[u8],
        pairs: &[(PathBuf, PathBuf)],
    ) -> Result<(), ReplicationError>;
}

/// Creates sources for the manager. The factory decides the concrete shipper
/// implementation; the manager only fixes the queue and peer binding.
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        queue_id: QueueId,
        peer: Arc<ReplicationPeer>,
    ) -> OspreyResult<Arc<dyn ReplicationSource>>;
}
