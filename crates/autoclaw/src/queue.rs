use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Global single-flight serialiser for agent invocations.
///
/// Agent CLIs are memory-heavy and share on-disk session state; overlapping
/// runs cause OOM kills and scrambled outputs. At most one run executes at a
/// time and callers are served in arrival order (the tokio mutex queue is
/// fair). A queued-but-not-started run is cancelled by dropping its future.
#[derive(Default)]
pub struct CommandQueue {
    lock: Mutex<()>,
    pending: AtomicUsize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued or in-flight right now.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Serialise `run`. `on_wait(wait_ms, ahead)` fires exactly once, after
    /// the slot is acquired and before `run` starts, when `ahead > 0` callers
    /// were pending at submission.
    pub async fn enqueue<F, Fut, T>(&self, run: F, on_wait: impl FnOnce(u64, usize)) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ahead = self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard {
            counter: &self.pending,
        };
        let submitted = Instant::now();

        let _slot = self.lock.lock().await;
        if ahead > 0 {
            on_wait(submitted.elapsed().as_millis() as u64, ahead);
        }
        run().await
    }
}

struct PendingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
