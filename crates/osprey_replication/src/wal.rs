//! WAL naming and the shipped-batch bookkeeping types.
//!
//! A WAL is referenced everywhere by its base file name, never by a full
//! path. Names are structured `<group>.<sequence>` where the group (the "WAL
//! prefix") identifies an independent, lexicographically ordered sequence of
//! logs. Synchronous-replication WALs additionally embed the peer id:
//! `<group>.<sequence>.<peer>.syncrep`, so cleanup can tell which remote
//! copies belong to which peer.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Suffix marking a WAL staged for synchronous replication.
pub const SYNC_REPLICATION_WAL_SUFFIX: &str = "syncrep";

/// The log group a WAL name belongs to: everything before the first `.`.
/// Names without a `.` form a group of their own.
pub fn wal_prefix(name: &str) -> &str {
    name.split_once('.').map(|(prefix, _)| prefix).unwrap_or(name)
}

/// Extract the peer id embedded in a synchronous-replication WAL name,
/// or `None` for ordinary WALs.
pub fn sync_replication_peer_id(name: &str) -> Option<&str> {
    let rest = name.strip_suffix(".syncrep")?;
    rest.rsplit_once('.').map(|(_, peer)| peer)
}

/// Compose a synchronous-replication WAL name.
pub fn sync_replication_wal_name(group: &str, sequence: u64, peer_id: &str) -> String {
    format!("{group}.{sequence}.{peer_id}.{SYNC_REPLICATION_WAL_SUFFIX}")
}

/// Base name of a WAL path as UTF-8, e.g. `w.100` for `/wals/w.100`.
pub fn wal_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

// ---------------------------------------------------------------------------
// WalEntry / WalEntryBatch
// ---------------------------------------------------------------------------

/// A single WAL edit read by a source, opaque to the manager. Only its size
/// matters here: it is charged against the global buffer quota while the
/// entry sits in an unshipped batch.
#[derive(Debug, Clone)]
pub struct WalEntry {
    payload: Bytes,
}

impl WalEntry {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// One shipped batch of WAL edits, reported back by a source after a push to
/// the remote cluster succeeds. Carries where reading stopped so the manager
/// can persist the position and prune fully shipped WALs.
#[derive(Debug)]
pub struct WalEntryBatch {
    /// Path of the WAL the last entry was read from.
    pub last_wal_path: PathBuf,
    /// Byte offset after the last entry read from `last_wal_path`.
    pub last_wal_position: u64,
    /// Highest sequence id shipped per region, keyed by encoded region name.
    pub last_seq_ids: HashMap<String, u64>,
    /// True when the batch drained `last_wal_path` to its end.
    pub end_of_file: bool,
    used_buffer_size: AtomicU64,
}

impl WalEntryBatch {
    pub fn new(last_wal_path: PathBuf) -> Self {
        Self {
            last_wal_path,
            last_wal_position: 0,
            last_seq_ids: HashMap::new(),
            end_of_file: false,
            used_buffer_size: AtomicU64::new(0),
        }
    }

    /// Base name of the last WAL, or `None` when the path has no UTF-8 name.
    pub fn last_wal_name(&self) -> Option<&str> {
        wal_name(&self.last_wal_path)
    }

    /// Track `entry`'s size against this batch. Returns the entry size so
    /// the caller can charge the same amount to the global quota.
    pub fn increment_used_buffer_size(&self, entry: &WalEntry) -> u64 {
        let size = entry.size();
        self.used_buffer_size.fetch_add(size, Ordering::SeqCst);
        size
    }

    /// Total bytes this batch has charged to the global quota.
    pub fn used_buffer_size(&self) -> u64 {
        self.used_buffer_size.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// WalFs: filesystem seam for remote WAL cleanup
// ---------------------------------------------------------------------------

/// Minimal filesystem interface for deleting staged remote WAL copies of a
/// synchronous-replication peer. The remote directory may live on a slow or
/// unreachable cluster filesystem, so callers must never hold internal locks
/// across these calls.
pub trait WalFs: Send + Sync {
    /// Delete `path`. Deleting a missing file is an error (`NotFound`);
    /// callers that treat absence as success must check the error kind.
    fn delete(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// `WalFs` over the local filesystem.
#[derive(Debug, Default)]
pub struct LocalWalFs;

impl WalFs for LocalWalFs {
    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
