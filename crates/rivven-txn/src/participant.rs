//! Transaction participants
//!
//! A participant is the resource manager of one topic partition or one
//! consumer group. The coordinator drives it through
//! `begin_tx → prepare_tx → commit_tx | abort_tx`; every call is
//! idempotent for a given `(pid, tx_seq)`.
//!
//! The two resource kinds are closed: [`ResourceKind`] is sealed and only
//! implemented by [`TopicPartition`] and [`GroupId`].

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use crate::error::TxErrc;
use crate::types::{GroupId, ProducerIdentity, Term, TopicPartition, TxSeq};

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::types::TopicPartition {}
    impl Sealed for crate::types::GroupId {}
}

/// A kind of transactional resource
pub trait ResourceKind:
    sealed::Sealed + Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Label used in logs
    const KIND: &'static str;
}

impl ResourceKind for TopicPartition {
    const KIND: &'static str = "partition";
}

impl ResourceKind for GroupId {
    const KIND: &'static str = "group";
}

/// Participant answer to `prepare_tx`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareVote {
    Prepared,
    Rejected,
}

/// Resource manager of one kind of participant
#[async_trait]
pub trait ResourceManager<K: ResourceKind>: Send + Sync + 'static {
    /// Start `(pid, tx_seq)` on `resource`, returning its fencing token
    async fn begin_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        tx_timeout: Duration,
    ) -> Result<Term, TxErrc>;

    /// Vote on committing `(pid, tx_seq)`; `etag` is the token from `begin_tx`
    async fn prepare_tx(
        &self,
        resource: &K,
        etag: Term,
        tm_partition: u32,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> Result<PrepareVote, TxErrc>;

    async fn commit_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> Result<(), TxErrc>;

    async fn abort_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        timeout: Duration,
    ) -> Result<(), TxErrc>;
}

/// Run `call` against every target concurrently, each bounded by `timeout`
pub async fn fan_out<K, T, F, Fut>(
    targets: Vec<K>,
    timeout: Duration,
    call: F,
) -> Vec<(K, Result<T, TxErrc>)>
where
    K: Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T, TxErrc>>,
{
    join_all(targets.into_iter().map(|target| {
        let request = call(target.clone());
        async move {
            let result = match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            };
            (target, result)
        }
    }))
    .await
}

// ============================================================================
// In-memory participant
// ============================================================================

/// Participant call, for fault injection and call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantOp {
    Begin,
    Prepare,
    Commit,
    Abort,
}

/// State of one transaction on an in-memory participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantTxState {
    Begun,
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct ResourceState {
    term: Term,
    txs: HashMap<(ProducerIdentity, TxSeq), ParticipantTxState>,
}

#[derive(Debug)]
struct ParticipantInner<K> {
    resources: HashMap<K, ResourceState>,
    reject_prepare: HashSet<K>,
    failures: HashMap<(ParticipantOp, K), usize>,
    calls: HashMap<(ParticipantOp, K), usize>,
    delay: Option<Duration>,
}

/// In-memory resource manager with fault injection
///
/// Resources must be created before use; calls on unknown resources fail
/// with [`TxErrc::PartitionNotFound`].
#[derive(Debug)]
pub struct InMemoryResourceManager<K> {
    inner: Mutex<ParticipantInner<K>>,
}

pub type InMemoryPartitions = InMemoryResourceManager<TopicPartition>;
pub type InMemoryGroups = InMemoryResourceManager<GroupId>;

impl<K: ResourceKind> Default for InMemoryResourceManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ResourceKind> InMemoryResourceManager<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ParticipantInner {
                resources: HashMap::new(),
                reject_prepare: HashSet::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                delay: None,
            }),
        }
    }

    pub fn with_resources(resources: impl IntoIterator<Item = K>) -> Self {
        let manager = Self::new();
        for resource in resources {
            manager.create(resource);
        }
        manager
    }

    /// Create `resource` at term 1
    pub fn create(&self, resource: K) {
        self.inner.lock().resources.entry(resource).or_insert(ResourceState {
            term: Term(1),
            txs: HashMap::new(),
        });
    }

    /// Change the leadership term of `resource`; older fencing tokens are rejected
    pub fn set_term(&self, resource: &K, term: Term) {
        if let Some(state) = self.inner.lock().resources.get_mut(resource) {
            state.term = term;
        }
    }

    /// Vote `Rejected` on every prepare of `resource`
    pub fn reject_prepare(&self, resource: K) {
        self.inner.lock().reject_prepare.insert(resource);
    }

    /// Fail the next `n` calls of `op` on `resource` with [`TxErrc::Timeout`]
    pub fn fail_next(&self, op: ParticipantOp, resource: K, n: usize) {
        self.inner.lock().failures.insert((op, resource), n);
    }

    /// Delay every call
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner.lock().delay = delay;
    }

    /// Calls of `op` made on `resource`, including failed ones
    pub fn calls(&self, op: ParticipantOp, resource: &K) -> usize {
        self.inner
            .lock()
            .calls
            .get(&(op, resource.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn state_of(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
    ) -> Option<ParticipantTxState> {
        self.inner
            .lock()
            .resources
            .get(resource)
            .and_then(|state| state.txs.get(&(pid, tx_seq)).copied())
    }

    async fn enter(&self, op: ParticipantOp, resource: &K) -> Result<(), TxErrc> {
        let delay = {
            let mut inner = self.inner.lock();
            *inner.calls.entry((op, resource.clone())).or_insert(0) += 1;
            if let Some(remaining) = inner.failures.get_mut(&(op, resource.clone())) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TxErrc::Timeout);
                }
            }
            if !inner.resources.contains_key(resource) {
                return Err(TxErrc::PartitionNotFound);
            }
            inner.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn with_state<T>(
        &self,
        resource: &K,
        f: impl FnOnce(&mut ResourceState, bool) -> Result<T, TxErrc>,
    ) -> Result<T, TxErrc> {
        let mut inner = self.inner.lock();
        let reject = inner.reject_prepare.contains(resource);
        let state = inner
            .resources
            .get_mut(resource)
            .ok_or(TxErrc::PartitionNotFound)?;
        f(state, reject)
    }
}

#[async_trait]
impl<K: ResourceKind> ResourceManager<K> for InMemoryResourceManager<K> {
    async fn begin_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        _tx_timeout: Duration,
    ) -> Result<Term, TxErrc> {
        self.enter(ParticipantOp::Begin, resource).await?;
        self.with_state(resource, |state, _| {
            let entry = state
                .txs
                .entry((pid, tx_seq))
                .or_insert(ParticipantTxState::Begun);
            match entry {
                ParticipantTxState::Begun | ParticipantTxState::Prepared => Ok(state.term),
                ParticipantTxState::Committed | ParticipantTxState::Aborted => {
                    Err(TxErrc::RequestRejected)
                }
            }
        })
    }

    async fn prepare_tx(
        &self,
        resource: &K,
        etag: Term,
        _tm_partition: u32,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        _timeout: Duration,
    ) -> Result<PrepareVote, TxErrc> {
        self.enter(ParticipantOp::Prepare, resource).await?;
        self.with_state(resource, |state, reject| {
            if reject || etag != state.term {
                return Ok(PrepareVote::Rejected);
            }
            match state.txs.get_mut(&(pid, tx_seq)) {
                Some(tx @ (ParticipantTxState::Begun | ParticipantTxState::Prepared)) => {
                    *tx = ParticipantTxState::Prepared;
                    Ok(PrepareVote::Prepared)
                }
                Some(ParticipantTxState::Committed) => Ok(PrepareVote::Prepared),
                Some(ParticipantTxState::Aborted) | None => Ok(PrepareVote::Rejected),
            }
        })
    }

    async fn commit_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        _timeout: Duration,
    ) -> Result<(), TxErrc> {
        self.enter(ParticipantOp::Commit, resource).await?;
        self.with_state(resource, |state, _| match state.txs.get_mut(&(pid, tx_seq)) {
            Some(tx @ (ParticipantTxState::Prepared | ParticipantTxState::Committed)) => {
                *tx = ParticipantTxState::Committed;
                Ok(())
            }
            Some(ParticipantTxState::Begun | ParticipantTxState::Aborted) => {
                Err(TxErrc::RequestRejected)
            }
            None => Ok(()),
        })
    }

    async fn abort_tx(
        &self,
        resource: &K,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        _timeout: Duration,
    ) -> Result<(), TxErrc> {
        self.enter(ParticipantOp::Abort, resource).await?;
        self.with_state(resource, |state, _| {
            let tx = state
                .txs
                .entry((pid, tx_seq))
                .or_insert(ParticipantTxState::Aborted);
            if *tx == ParticipantTxState::Committed {
                return Err(TxErrc::RequestRejected);
            }
            *tx = ParticipantTxState::Aborted;
            Ok(())
        })
    }
}
