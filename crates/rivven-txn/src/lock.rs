//! Per-transactional-id async locks

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::TransactionalId;

/// Registry of one async mutex per transactional id
///
/// Locks are created on first use and kept for the lifetime of the
/// registry. Distinct ids never contend.
#[derive(Debug, Default)]
pub struct TxLocks {
    locks: DashMap<TransactionalId, Arc<Mutex<()>>>,
}

impl TxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(id) {
            return lock.value().clone();
        }
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Wait for exclusive access to `id`
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    /// Exclusive access to `id` if nobody holds it
    pub fn try_acquire(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(id).try_lock_owned().ok()
    }

    /// Run `f` while holding the lock of `id`
    pub async fn with_lock<F, Fut, T>(&self, id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(id).await;
        f().await
    }

    /// The lock of `id` is currently held
    pub fn is_locked(&self, id: &str) -> bool {
        self.locks
            .get(id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
