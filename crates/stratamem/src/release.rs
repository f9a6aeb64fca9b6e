//! Deferred release of evicted values
//!
//! Evicted entries are handed to a dedicated thread so value destructors run
//! neither under the cache lock nor on the caller's hot path. The channel is
//! bounded: when the release thread falls behind, the batch is dropped
//! synchronously on the caller thread to preserve progress.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::trace;

use crate::lru::Evicted;

/// Executor the host registers to run final releases on its main thread.
///
/// The cache hands it a closure that drops a batch of evicted values; the
/// host is expected to run the closure on its main/UI thread.
pub type MainThreadExecutor = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Pending batches the release thread may buffer before callers fall back to
/// dropping inline.
const RELEASE_QUEUE_DEPTH: usize = 64;

pub(crate) struct ReleasePool<V> {
    tx: Option<SyncSender<Vec<Evicted<V>>>>,
    handle: Option<JoinHandle<()>>,
}

impl<V: Send + 'static> ReleasePool<V> {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel::<Vec<Evicted<V>>>(RELEASE_QUEUE_DEPTH);
        let handle = std::thread::spawn(move || {
            while let Ok(batch) = rx.recv() {
                for entry in &batch {
                    trace!(key = %entry.key, cost = entry.cost, "releasing evicted entry");
                }
                drop(batch);
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a batch for release off-thread; drops it inline when the queue
    /// is full or the thread is gone.
    pub fn submit(&self, batch: Vec<Evicted<V>>) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) | Err(TrySendError::Disconnected(batch)) => {
                drop(batch);
            }
        }
    }
}

impl<V> Drop for ReleasePool<V> {
    fn drop(&mut self) {
        // Disconnect the channel so the thread drains and exits.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountsDrops(Arc<AtomicUsize>);

    impl Drop for CountsDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_submitted_batches_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ReleasePool::new();

        for i in 0..10 {
            pool.submit(vec![Evicted {
                key: format!("k{}", i),
                value: CountsDrops(drops.clone()),
                cost: 0,
            }]);
        }

        // Joining the thread guarantees all destructors ran.
        drop(pool);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_joins_cleanly_when_idle() {
        let pool: ReleasePool<String> = ReleasePool::new();
        drop(pool);
    }
}
