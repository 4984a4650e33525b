//! Transaction status state machine and the durable transaction record
//!
//! ```text
//!            add                commit              prepare ok
//!  ready ────────▶ ongoing ──────────▶ preparing ──────────▶ prepared
//!    ▲   ◀─┐        │  │                   │                    │
//!    │     │ re-    │  │ abort             │ prepare rejected   │ commit
//!    │     │ register  ▼                   ▼                    │ fan-out
//!    │     └──┘   aborting            killed ◀── kill (ongoing) │
//!    │              │                   │                       │
//!    └──────────────┴───── abort fan-out┴───────────────────────┘
//! ```
//!
//! Every status change goes through [`TxStatus::on`], which either returns
//! the next status or an [`InvalidTransition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::{
    GroupId, ProducerIdentity, Term, TopicPartition, TransactionalId, TxGroup, TxPartition, TxSeq,
};

/// Status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// No transaction in progress; waiting for the next one
    Ready,
    /// Resources are being added
    Ongoing,
    /// Prepare fan-out in flight, outcome not decided yet
    Preparing,
    /// Every participant prepared; committed
    Prepared,
    /// Client asked to abort
    Aborting,
    /// Aborted by the coordinator (prepare rejected, timeout or try_abort)
    Killed,
}

impl TxStatus {
    /// Outcome is durable and must be driven to completion
    pub fn is_decided(&self) -> bool {
        matches!(self, TxStatus::Prepared | TxStatus::Aborting | TxStatus::Killed)
    }

    /// Needs a rollforward before any new operation is admitted
    pub fn needs_rollforward(&self) -> bool {
        self.is_decided() || matches!(self, TxStatus::Preparing)
    }

    /// Decided states that resolve to an abort
    pub fn is_aborting(&self) -> bool {
        matches!(self, TxStatus::Aborting | TxStatus::Killed)
    }

    /// Apply `event`, returning the next status
    pub fn on(self, event: TxEvent) -> Result<TxStatus, InvalidTransition> {
        use TxEvent::*;
        use TxStatus::*;

        let next = match (self, event) {
            (Ready, AddResource) | (Ongoing, AddResource) => Ongoing,
            (Ready, Reregister) | (Ready, Refresh) => Ready,
            (Ongoing, Commit) => Preparing,
            (Ongoing, Abort) => Aborting,
            (Ongoing, Kill) => Killed,
            (Preparing, PrepareSucceeded) => Prepared,
            (Preparing, PrepareRejected) => Killed,
            (Prepared, Finish) | (Aborting, Finish) | (Killed, Finish) => Ready,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Ready => "ready",
            TxStatus::Ongoing => "ongoing",
            TxStatus::Preparing => "preparing",
            TxStatus::Prepared => "prepared",
            TxStatus::Aborting => "aborting",
            TxStatus::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Event driving a status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxEvent {
    /// Partition or consumer group registered
    AddResource,
    /// Client asked to commit
    Commit,
    /// Every participant acknowledged prepare
    PrepareSucceeded,
    /// At least one participant rejected prepare
    PrepareRejected,
    /// Client asked to abort
    Abort,
    /// Coordinator-initiated abort (timeout or try_abort)
    Kill,
    /// Commit or abort fan-out completed
    Finish,
    /// Producer re-initialized with a new identity
    Reregister,
    /// Record rewritten under the current term
    Refresh,
}

/// Rejected status transition
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: TxStatus,
    pub event: TxEvent,
}

/// Outcome of the previous transaction of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub pid: ProducerIdentity,
    pub tx_seq: TxSeq,
    pub committed: bool,
}

/// Durable transaction record, one per transactional id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmTransaction {
    pub id: TransactionalId,
    pub pid: ProducerIdentity,
    pub tx_seq: TxSeq,
    /// Term at which the status last changed
    pub etag: Term,
    pub status: TxStatus,
    pub partitions: Vec<TxPartition>,
    pub groups: Vec<TxGroup>,
    pub timeout: Duration,
    pub updated_at_ms: u64,
    pub last_outcome: Option<TxOutcome>,
    /// Last identity held under the producer id this record replaced
    pub previous_pid: Option<ProducerIdentity>,
}

impl TmTransaction {
    /// Fresh `ready` record for a newly registered producer
    pub fn new(
        id: impl Into<TransactionalId>,
        pid: ProducerIdentity,
        timeout: Duration,
        etag: Term,
    ) -> Self {
        Self {
            id: id.into(),
            pid,
            tx_seq: TxSeq::default(),
            etag,
            status: TxStatus::Ready,
            partitions: Vec::new(),
            groups: Vec::new(),
            timeout,
            updated_at_ms: 0,
            last_outcome: None,
            previous_pid: None,
        }
    }

    /// Record describes the transaction attempt `(pid, tx_seq)`
    pub fn is_attempt(&self, pid: &ProducerIdentity, tx_seq: TxSeq) -> bool {
        self.pid == *pid && self.tx_seq == tx_seq
    }

    /// Move to `next`, remembering the old identity when the producer id changes
    pub fn set_pid(&mut self, next: ProducerIdentity) {
        if next.id != self.pid.id {
            self.previous_pid = Some(self.pid);
        }
        self.pid = next;
    }

    /// Outcome of the finished attempt `(pid, tx_seq)`, if that was the last one
    pub fn outcome_of(&self, pid: &ProducerIdentity, tx_seq: TxSeq) -> Option<TxOutcome> {
        self.last_outcome
            .filter(|outcome| outcome.pid == *pid && outcome.tx_seq == tx_seq)
    }

    pub fn has_partition(&self, tp: &TopicPartition) -> bool {
        self.partitions.iter().any(|p| p.tp == *tp)
    }

    pub fn has_group(&self, group_id: &GroupId) -> bool {
        self.groups.iter().any(|g| g.group_id == *group_id)
    }

    /// Ongoing transaction whose timeout elapsed since its last update
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        self.status == TxStatus::Ongoing
            && self.updated_at_ms.saturating_add(timeout_ms) <= now_ms
    }

    /// Apply `event`; the etag moves to `term` when the status changes
    pub fn transition(&mut self, event: TxEvent, term: Term) -> Result<(), InvalidTransition> {
        let next = self.status.on(event)?;
        if next != self.status || matches!(event, TxEvent::Reregister | TxEvent::Refresh) {
            self.etag = term;
        }
        self.status = next;
        Ok(())
    }

    /// Complete the current transaction and prepare the record for the next
    pub fn finish(
        &mut self,
        next_pid: ProducerIdentity,
        term: Term,
    ) -> Result<TxOutcome, InvalidTransition> {
        let committed = self.status == TxStatus::Prepared;
        self.transition(TxEvent::Finish, term)?;
        let outcome = TxOutcome {
            pid: self.pid,
            tx_seq: self.tx_seq,
            committed,
        };
        self.last_outcome = Some(outcome);
        self.set_pid(next_pid);
        self.tx_seq = self.tx_seq.next();
        self.partitions.clear();
        self.groups.clear();
        Ok(outcome)
    }
}
