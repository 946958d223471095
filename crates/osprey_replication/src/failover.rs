//! Worker pool for dead-node failover claims.
//!
//! Claim tasks are long: they sleep a randomized jitter, then do storage
//! round-trips. A small fixed pool keeps failover work off the caller's
//! thread (the node-death watcher) and bounds how many dead nodes are
//! processed at once. The default of one worker means strictly sequential
//! failover.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;

pub(crate) type FailoverTask = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size task runner. Submitted tasks queue up and are executed in
/// submission order per worker; `shutdown` stops intake, lets queued tasks
/// drain, and leaves the workers to exit on their own.
pub(crate) struct FailoverExecutor {
    sender: Mutex<Option<mpsc::Sender<FailoverTask>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl FailoverExecutor {
    pub fn new(worker_count: usize) -> std::io::Result<Self> {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<FailoverTask>();
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("osprey-replication-failover-{idx}"))
                .spawn(move || loop {
                    let task = {
                        let guard = receiver.lock();
                        guard.recv()
                    };
                    match task {
                        Ok(task) => {
                            task();
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        // Sender dropped: shutdown, queue drained.
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            in_flight,
        })
    }

    /// Queue a task. Returns false when the executor has been shut down.
    pub fn submit(&self, task: FailoverTask) -> bool {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                if sender.send(task).is_err() {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Tasks submitted but not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks. Already-queued tasks still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Shut down and wait for the workers to drain the queue. Test-oriented;
    /// node shutdown uses the non-blocking `shutdown`.
    #[allow(dead_code)]
    pub fn shutdown_and_join(&self) {
        self.shutdown();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Uniform-ish fraction in `[0, 1)` for failover jitter, derived from the
/// clock. Good enough to smear claim storms; not a statistical primitive.
pub(crate) fn jitter_fraction() -> f64 {
    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    (hasher.finish() % 1_024) as f64 / 1_024.0
}
