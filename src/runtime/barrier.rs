//! Worker completion barrier.
//!
//! Each worker takes a [`WorkerGuard`] before it starts; dropping the guard
//! deregisters it, so a worker that returns early or unwinds is still
//! accounted for. [`CompletionBarrier::wait`] resolves once the count is zero.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts outstanding workers.
#[derive(Clone, Debug)]
pub struct CompletionBarrier {
    count: Arc<watch::Sender<usize>>,
}

impl CompletionBarrier {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Registers one worker. The returned guard deregisters on drop.
    #[must_use = "dropping the guard deregisters the worker immediately"]
    pub fn register(&self) -> WorkerGuard {
        self.count.send_modify(|c| *c += 1);
        WorkerGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Number of registered workers still running
    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    /// Blocks until every registered worker has deregistered.
    /// Returns immediately when none are registered.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle held by one worker for its whole lifetime.
#[derive(Debug)]
pub struct WorkerGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}
