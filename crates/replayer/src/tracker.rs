//! Tracks asynchronous operations issued on behalf of the listener so that
//! shutdown can join them before completing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counter of outstanding tracked operations.
///
/// Cheap to clone; all clones share the same counter.
#[derive(Clone)]
pub struct AsyncOpTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    ops: AtomicU64,
    drained: Notify,
}

impl AsyncOpTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                ops: AtomicU64::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn start_op(&self) {
        self.inner.ops.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish_op(&self) {
        if self.inner.ops.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of operations currently in flight.
    pub fn outstanding(&self) -> u64 {
        self.inner.ops.load(Ordering::Acquire)
    }

    /// Wait until every tracked operation has finished.
    pub async fn wait_for_ops(&self) {
        loop {
            // register interest before the counter check to avoid missing a
            // notify_waiters between check and await
            let drained = self.inner.drained.notified();
            if self.inner.ops.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Default for AsyncOpTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let tracker = AsyncOpTracker::new();
        tracker.wait_for_ops().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_drained() {
        let tracker = AsyncOpTracker::new();
        tracker.start_op();
        tracker.start_op();

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_ops().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        tracker.finish_op();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        tracker.finish_op();
        handle.await.unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }
}
