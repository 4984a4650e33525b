//! Replicated log backing the transaction store
//!
//! The coordinator does not replicate anything itself. It appends encoded
//! [`LogEntry`] values to a [`TxLog`] and applies them once the append
//! returns. On startup or failover the store is rebuilt from the latest
//! [`TxSnapshot`] plus the entries appended after it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LogError;
use crate::state::TmTransaction;
use crate::types::Term;

/// Log entry: the full record after a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub record: TmTransaction,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Bytes, LogError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Point-in-time image of every record, covering entries up to `last_offset`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxSnapshot {
    pub last_offset: Option<u64>,
    pub records: Vec<TmTransaction>,
}

impl TxSnapshot {
    pub fn encode(&self) -> Result<Bytes, LogError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Data needed to rebuild the store
#[derive(Debug, Clone, Default)]
pub struct LogReplay {
    pub snapshot: Option<Bytes>,
    /// `(offset, entry)` pairs after the snapshot, in log order
    pub entries: Vec<(u64, Bytes)>,
}

/// Replicated, ordered log of a coordinator partition
#[async_trait]
pub trait TxLog: Send + Sync {
    /// Current leadership term
    fn term(&self) -> Term;

    /// This replica is the leader of the current term
    fn is_leader(&self) -> bool;

    /// Durably append an entry, returning its offset
    async fn append(&self, entry: Bytes) -> Result<u64, LogError>;

    /// Wait until every entry of the current term is applied locally
    async fn barrier(&self, timeout: Duration) -> Result<(), LogError>;

    /// Latest snapshot and the entries after it
    async fn replay(&self) -> Result<LogReplay, LogError>;

    /// Install a snapshot covering entries up to `last_offset`
    async fn write_snapshot(&self, snapshot: Bytes, last_offset: u64) -> Result<(), LogError>;
}

#[derive(Debug, Default)]
struct LogInner {
    term: Term,
    leader: bool,
    next_offset: u64,
    entries: Vec<(u64, Bytes)>,
    snapshot: Option<(u64, Bytes)>,
    fail_appends: usize,
}

/// Single-replica in-memory [`TxLog`]
///
/// Durable for the lifetime of the value: several stores may be built over
/// the same log to model a coordinator restart. Leadership and append
/// failures can be injected.
#[derive(Debug)]
pub struct InMemoryTxLog {
    inner: Mutex<LogInner>,
}

impl Default for InMemoryTxLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTxLog {
    /// Leader log at term 1
    pub fn new() -> Self {
        Self::with_term(Term(1))
    }

    pub fn with_term(term: Term) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                term,
                leader: true,
                ..Default::default()
            }),
        }
    }

    /// Become leader of a new term
    pub fn elect(&self, term: Term) {
        let mut inner = self.inner.lock();
        inner.term = term;
        inner.leader = true;
    }

    /// Lose leadership; appends and barriers fail until re-elected
    pub fn step_down(&self) {
        self.inner.lock().leader = false;
    }

    /// Fail the next `n` appends
    pub fn fail_next_appends(&self, n: usize) {
        self.inner.lock().fail_appends = n;
    }

    /// Entries currently retained after the snapshot
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TxLog for InMemoryTxLog {
    fn term(&self) -> Term {
        self.inner.lock().term
    }

    fn is_leader(&self) -> bool {
        self.inner.lock().leader
    }

    async fn append(&self, entry: Bytes) -> Result<u64, LogError> {
        let mut inner = self.inner.lock();
        if !inner.leader {
            return Err(LogError::NotLeader { term: inner.term.0 });
        }
        if inner.fail_appends > 0 {
            inner.fail_appends -= 1;
            return Err(LogError::Unavailable("injected append failure".into()));
        }
        let offset = inner.next_offset;
        inner.next_offset += 1;
        inner.entries.push((offset, entry));
        Ok(offset)
    }

    async fn barrier(&self, _timeout: Duration) -> Result<(), LogError> {
        let inner = self.inner.lock();
        if inner.leader {
            Ok(())
        } else {
            Err(LogError::NotLeader { term: inner.term.0 })
        }
    }

    async fn replay(&self) -> Result<LogReplay, LogError> {
        let inner = self.inner.lock();
        Ok(LogReplay {
            snapshot: inner.snapshot.as_ref().map(|(_, bytes)| bytes.clone()),
            entries: inner.entries.clone(),
        })
    }

    async fn write_snapshot(&self, snapshot: Bytes, last_offset: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|(offset, _)| *offset > last_offset);
        inner.snapshot = Some((last_offset, snapshot));
        Ok(())
    }
}
