//! Producer id allocation

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::TxErrc;

/// Source of cluster-unique producer ids
#[async_trait]
pub trait ProducerIdAllocator: Send + Sync {
    async fn allocate_id(&self) -> Result<i64, TxErrc>;
}

/// Monotonic in-process allocator
#[derive(Debug)]
pub struct SequentialIdAllocator {
    next: AtomicI64,
}

impl SequentialIdAllocator {
    pub fn new(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ProducerIdAllocator for SequentialIdAllocator {
    async fn allocate_id(&self) -> Result<i64, TxErrc> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        if id < 0 {
            return Err(TxErrc::UnknownServerError);
        }
        Ok(id)
    }
}
