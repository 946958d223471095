//! Observability counters for replication sources.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide replication gauges, shared by every source on this node.
#[derive(Debug, Default)]
pub struct GlobalSourceMetrics {
    /// Bytes of batched edits currently held in memory across all sources.
    wal_reader_edits_buffer_bytes: AtomicI64,
}

impl GlobalSourceMetrics {
    pub fn set_wal_reader_edits_buffer_bytes(&self, bytes: i64) {
        self.wal_reader_edits_buffer_bytes
            .store(bytes, Ordering::SeqCst);
    }

    pub fn wal_reader_edits_buffer_bytes(&self) -> i64 {
        self.wal_reader_edits_buffer_bytes.load(Ordering::SeqCst)
    }
}

/// Per-source counters. Sources update these from their reader and shipper
/// threads; the manager clears them when a source is replaced for good and
/// deliberately keeps them across a config refresh.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pub logs_enqueued: AtomicU64,
    pub batches_shipped: AtomicU64,
    pub edits_shipped: AtomicU64,
    pub bytes_shipped: AtomicU64,
}

impl SourceMetrics {
    pub fn clear(&self) {
        self.logs_enqueued.store(0, Ordering::Relaxed);
        self.batches_shipped.store(0, Ordering::Relaxed);
        self.edits_shipped.store(0, Ordering::Relaxed);
        self.bytes_shipped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            logs_enqueued: self.logs_enqueued.load(Ordering::Relaxed),
            batches_shipped: self.batches_shipped.load(Ordering::Relaxed),
            edits_shipped: self.edits_shipped.load(Ordering::Relaxed),
            bytes_shipped: self.bytes_shipped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SourceMetrics`] for reporting.
#[derive(Debug, Clone, Default)]
pub struct SourceMetricsSnapshot {
    pub logs_enqueued: u64,
    pub batches_shipped: u64,
    pub edits_shipped: u64,
    pub bytes_shipped: u64,
}
