use std::sync::Arc;

use strum::Display;
use tokio::sync::RwLock;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

#[derive(PartialEq, Debug, Copy, Clone, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutorState {
    #[default]
    Running,
    Stopping,
    Stopped,
}

/// Shared execution context of a server or client.
///
/// Every task that belongs to the component is spawned on the tracker, so
/// the tracker doubles as the work guard: [`ExecutorCtx::join`] returns only
/// when the listener and every outstanding session have finished. The
/// cancellation token is the stop signal all long-running tasks select on.
#[derive(Clone)]
pub struct ExecutorCtx {
    state: Arc<RwLock<ExecutorState>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Default for ExecutorCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorCtx {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ExecutorState::Running)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn state(&self) -> ExecutorState {
        *self.state.read().await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Request all tasks to stop. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait until every tracked task has finished.
    pub async fn join(&self) {
        {
            let mut state = self.state.write().await;
            if *state == ExecutorState::Stopped {
                return;
            }
            *state = ExecutorState::Stopping;
        }

        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(target: "executor", "waiting for {} tasks to stop", self.tracker.len());
        }
        self.tracker.wait().await;

        *self.state.write().await = ExecutorState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[test(tokio::test)]
    async fn test_join_waits_for_tracked_tasks() {
        let executor = ExecutorCtx::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            let token = executor.shutdown_token();
            executor.spawn(async move {
                token.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.stop();
        executor.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(executor.state().await, ExecutorState::Stopped);
    }

    #[test(tokio::test)]
    async fn test_stop_is_idempotent() {
        let executor = ExecutorCtx::new();
        executor.stop();
        executor.stop();
        executor.join().await;
        executor.join().await;
        assert!(executor.is_stopped());
    }
}
