//! Participant fan-out for the two-phase commit
//!
//! [`Participants`] issues begin/prepare/commit/abort to every partition and
//! group of a transaction in parallel. Commit and abort of a decided
//! transaction are retried until every participant acknowledged.
//! [`Decision`] carries the client-visible outcome out of a task that keeps
//! running after the decision is made.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::error::TxErrc;
use crate::gate::ShutdownGate;
use crate::participant::{fan_out, PrepareVote, ResourceKind, ResourceManager};
use crate::protocol::EndTxnReply;
use crate::state::TmTransaction;
use crate::types::{GroupId, ProducerIdentity, Term, TopicPartition, TxSeq};

/// Second phase of a decided transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Commit,
    Abort,
}

/// Aggregated prepare votes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Prepared,
    /// At least one participant voted no
    Rejected,
    /// No rejection, but some participant could not be reached
    Failed(TxErrc),
}

/// One-shot handle for the end_transaction decision
///
/// Dropping an undecided handle answers [`TxErrc::UnknownServerError`].
#[derive(Debug)]
pub struct Decision {
    reply: Option<oneshot::Sender<EndTxnReply>>,
}

impl Decision {
    pub fn channel() -> (Self, oneshot::Receiver<EndTxnReply>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply: Some(tx) }, rx)
    }

    /// Handle with nobody waiting on it
    pub fn detached() -> Self {
        Self { reply: None }
    }

    /// Publish `reply`; later calls are ignored
    pub fn decide(&mut self, reply: EndTxnReply) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(reply);
        }
    }

    /// Publish `error_code` unless already decided, returning it
    pub fn fail(&mut self, error_code: TxErrc) -> TxErrc {
        self.decide(EndTxnReply::error(error_code));
        error_code
    }

    pub fn is_decided(&self) -> bool {
        self.reply.is_none()
    }
}

impl Drop for Decision {
    fn drop(&mut self) {
        self.decide(EndTxnReply::error(TxErrc::UnknownServerError));
    }
}

/// Participants still owing an acknowledgement
#[derive(Debug, Default)]
struct Pending {
    partitions: Vec<TopicPartition>,
    groups: Vec<GroupId>,
}

impl Pending {
    fn of(tx: &TmTransaction) -> Self {
        Self {
            partitions: tx.partitions.iter().map(|p| p.tp.clone()).collect(),
            groups: tx.groups.iter().map(|g| g.group_id.clone()).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.partitions.is_empty() && self.groups.is_empty()
    }

    fn len(&self) -> usize {
        self.partitions.len() + self.groups.len()
    }
}

/// Partition and group resource managers of one coordinator partition
pub struct Participants<P, G> {
    partitions: Arc<P>,
    groups: Arc<G>,
    tm_partition: u32,
    timeout: Duration,
}

impl<P, G> Participants<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    pub fn new(partitions: Arc<P>, groups: Arc<G>, tm_partition: u32, timeout: Duration) -> Self {
        Self {
            partitions,
            groups,
            tm_partition,
            timeout,
        }
    }

    pub fn partitions(&self) -> &Arc<P> {
        &self.partitions
    }

    pub fn groups(&self) -> &Arc<G> {
        &self.groups
    }

    /// `begin_tx` on each partition, returning fencing tokens or errors
    pub async fn begin_partitions(
        &self,
        tx: &TmTransaction,
        partitions: Vec<TopicPartition>,
    ) -> Vec<(TopicPartition, Result<Term, TxErrc>)> {
        let (pid, tx_seq, tx_timeout) = (tx.pid, tx.tx_seq, tx.timeout);
        let rm = &self.partitions;
        fan_out(partitions, self.timeout, |tp| async move {
            rm.begin_tx(&tp, pid, tx_seq, tx_timeout).await
        })
        .await
    }

    pub async fn begin_group(&self, tx: &TmTransaction, group: &GroupId) -> Result<Term, TxErrc> {
        tokio::time::timeout(
            self.timeout,
            self.groups.begin_tx(group, tx.pid, tx.tx_seq, tx.timeout),
        )
        .await?
    }

    /// Prepare every registered participant
    pub async fn prepare(&self, tx: &TmTransaction) -> PrepareOutcome {
        let (pid, tx_seq, tm, timeout) = (tx.pid, tx.tx_seq, self.tm_partition, self.timeout);
        let (partitions, groups) = (&self.partitions, &self.groups);

        let (partition_votes, group_votes) = futures::join!(
            fan_out(tx.partitions.clone(), timeout, |p| async move {
                partitions
                    .prepare_tx(&p.tp, p.etag, tm, pid, tx_seq, timeout)
                    .await
            }),
            fan_out(tx.groups.clone(), timeout, |g| async move {
                groups
                    .prepare_tx(&g.group_id, g.etag, tm, pid, tx_seq, timeout)
                    .await
            }),
        );

        let votes = partition_votes
            .iter()
            .map(|(p, vote)| (p.tp.to_string(), TopicPartition::KIND, vote))
            .chain(
                group_votes
                    .iter()
                    .map(|(g, vote)| (g.group_id.to_string(), GroupId::KIND, vote)),
            );

        let mut outcome = PrepareOutcome::Prepared;
        for (resource, kind, vote) in votes {
            match vote {
                Ok(PrepareVote::Prepared) => {}
                Ok(PrepareVote::Rejected) => {
                    warn!(tx_id = %tx.id, pid = %pid, kind, resource = %resource, "Prepare rejected");
                    outcome = PrepareOutcome::Rejected;
                }
                Err(ec) => {
                    warn!(tx_id = %tx.id, pid = %pid, kind, resource = %resource, error = %ec, "Prepare failed");
                    if outcome == PrepareOutcome::Prepared {
                        outcome = PrepareOutcome::Failed(*ec);
                    }
                }
            }
        }
        outcome
    }

    /// Drive `phase` on every participant of `tx` until all acknowledged
    ///
    /// Only participants that failed are retried. Gives up with
    /// [`TxErrc::UnknownServerError`] when `retry` runs out of attempts or the
    /// gate closes; the record then stays decided for a later rollforward.
    pub async fn drive(
        &self,
        tx: &TmTransaction,
        phase: Phase,
        retry: &RetryConfig,
        gate: &ShutdownGate,
    ) -> Result<(), TxErrc> {
        let mut pending = Pending::of(tx);
        let mut attempts = 0;
        loop {
            self.round(tx, phase, &mut pending).await;
            attempts += 1;
            if pending.is_empty() {
                debug!(tx_id = %tx.id, ?phase, attempts, "Fan-out completed");
                return Ok(());
            }
            if retry.exhausted(attempts) {
                warn!(tx_id = %tx.id, ?phase, attempts, pending = pending.len(), "Fan-out incomplete, leaving for rollforward");
                return Err(TxErrc::UnknownServerError);
            }
            if !gate.sleep(retry.backoff(attempts - 1)).await {
                debug!(tx_id = %tx.id, ?phase, "Fan-out interrupted by shutdown");
                return Err(TxErrc::UnknownServerError);
            }
        }
    }

    async fn round(&self, tx: &TmTransaction, phase: Phase, pending: &mut Pending) {
        let (pid, tx_seq, timeout) = (tx.pid, tx.tx_seq, self.timeout);
        let (partitions, groups) = futures::join!(
            finish_on(
                self.partitions.as_ref(),
                std::mem::take(&mut pending.partitions),
                phase,
                pid,
                tx_seq,
                timeout,
            ),
            finish_on(
                self.groups.as_ref(),
                std::mem::take(&mut pending.groups),
                phase,
                pid,
                tx_seq,
                timeout,
            ),
        );
        pending.partitions = partitions;
        pending.groups = groups;
    }
}

/// Commit or abort on `targets`, returning the ones that failed
async fn finish_on<K, M>(
    rm: &M,
    targets: Vec<K>,
    phase: Phase,
    pid: ProducerIdentity,
    tx_seq: TxSeq,
    timeout: Duration,
) -> Vec<K>
where
    K: ResourceKind,
    M: ResourceManager<K>,
{
    let results = fan_out(targets, timeout, |target| async move {
        match phase {
            Phase::Commit => rm.commit_tx(&target, pid, tx_seq, timeout).await,
            Phase::Abort => rm.abort_tx(&target, pid, tx_seq, timeout).await,
        }
    })
    .await;

    results
        .into_iter()
        .filter_map(|(target, result)| match result {
            Ok(()) => None,
            Err(ec) if ec.is_rejection() => {
                error!(kind = K::KIND, resource = %target, pid = %pid, ?phase, error = %ec, "Participant refused a decided outcome");
                Some(target)
            }
            Err(ec) => {
                warn!(kind = K::KIND, resource = %target, pid = %pid, ?phase, error = %ec, "Participant call failed");
                Some(target)
            }
        })
        .collect()
}
