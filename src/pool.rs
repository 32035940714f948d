//! A fixed-size, priority-ordered worker pool.
//!
//! A min-heap of `(priority, seq, job)` behind a mutex, `max_workers`
//! persistent tokio tasks draining it, and an approximate
//! `pending_count()` probe that is the engine's only backpressure
//! signal.
//!
//! Cancellation follows a "drop on dequeue" idiom uniformly: the pool
//! itself never cancels a queued job; a job that is no longer wanted
//! checks its own liveness (via [`crate::subtask::Subtask::is_done`])
//! right before doing network I/O and is a no-op if it isn't.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct HeapEntry {
    priority: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest priority (and,
        // among ties, the earliest submission) pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolInner {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
    seq: AtomicU64,
    pending: AtomicUsize,
    shutdown: AtomicBool,
}

/// A priority thread pool whose pending work is ordered by a numeric
/// priority (lower dispatched first), ties broken by submission order.
pub struct PriorityWorkerPool {
    inner: Arc<PoolInner>,
}

impl PriorityWorkerPool {
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers >= 1, "max_workers must be at least 1");
        let inner = Arc::new(PoolInner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        for _ in 0..max_workers {
            let inner = inner.clone();
            tokio::spawn(async move { worker_loop(inner).await });
        }

        PriorityWorkerPool { inner }
    }

    /// Submits a job at the given priority (lower = dispatched earlier).
    pub fn submit(&self, priority: i64, job: Job) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.heap.lock().push(HeapEntry { priority, seq, job });
        self.inner.pending.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    /// Approximate count of submissions not yet picked up by a worker —
    /// the engine's only backpressure signal.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(AtomicOrdering::Relaxed)
    }

    /// Non-blocking shutdown: in-flight jobs run to completion, but
    /// anything still queued is dropped and idle workers exit
    /// immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Relaxed);
        self.inner.heap.lock().clear();
        self.inner.notify.notify_waiters();
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let next = inner.heap.lock().pop();
        match next {
            Some(entry) => {
                inner.pending.fetch_sub(1, AtomicOrdering::Relaxed);
                entry.job.await;
            }
            None => {
                if inner.shutdown.load(AtomicOrdering::Relaxed) {
                    return;
                }
                inner.notify.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_jobs_in_priority_order() {
        let pool = PriorityWorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, label) in [(5, 1), (1, 2), (3, 3)] {
            let order = order.clone();
            pool.submit(
                priority,
                Box::pin(async move {
                    order.lock().push(label);
                }),
            );
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*order.lock(), vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn pending_count_drains_to_zero() {
        let pool = PriorityWorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(
                0,
                Box::pin(async move {
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                }),
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
    }
}
