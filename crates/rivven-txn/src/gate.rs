//! Shutdown gate for detached coordinator work
//!
//! Decided commit/abort fan-out keeps running after the client got its
//! answer. The gate tracks those tasks so [`ShutdownGate::close`] can
//! wait for them, and exposes a cancellation token that interrupts retry
//! sleeps (never an in-flight participant RPC).

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::observability::TxMetrics;

#[derive(Debug, Clone, Default)]
pub struct ShutdownGate {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl ShutdownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task; `None` once the gate is closing
    pub fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return None;
        }
        let handle = self.tracker.spawn(task);
        TxMetrics::set_background_tasks(self.tracker.len());
        Some(handle)
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tracked tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Sleep for `duration`; `false` if the gate closed first
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Refuse new tasks, interrupt retry sleeps, and wait for tracked tasks
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        TxMetrics::set_background_tasks(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_close_waits_for_tasks() {
        let gate = ShutdownGate::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        gate.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        gate.close().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.spawn(async {}).is_none());
    }

    #[tokio::test]
    async fn test_close_interrupts_sleep() {
        let gate = ShutdownGate::new();
        let sleeper = gate.clone();
        let handle = gate
            .spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await })
            .unwrap();

        gate.close().await;
        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let gate = ShutdownGate::new();
        assert!(gate.sleep(Duration::from_millis(1)).await);
    }
}
