//! Cooperative stop signal for replication background work.
//!
//! The failover claimer sleeps a randomized jitter before adopting a dead
//! node's queues, and sync-replication cleanup backs off between remote
//! delete retries. Both sleeps must end the moment the node begins shutting
//! down, so they wait on a Condvar instead of a bare `thread::sleep`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Clonable stop flag with sub-millisecond wakeup of blocked waiters.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter immediately.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `stop()`. Returns true
    /// when the signal fired, i.e. the caller should abandon its work.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_stopped()
    }
}
