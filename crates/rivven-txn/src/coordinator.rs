//! Transaction coordinator of one coordinator partition
//!
//! Serializes operations per transactional id, persists every status change
//! through the [`TxStore`] and drives participants with [`Participants`].
//!
//! # Early decide, late execute
//!
//! `end_transaction` runs in a task tracked by the [`ShutdownGate`]. The
//! client is answered as soon as the outcome is durable (`prepared`,
//! `aborting` or `killed`); the same task then keeps the per-id lock while
//! commit/abort fan-out completes. A transaction left decided by a crash or
//! shutdown is rolled forward by the next operation on its id.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, RetryConfig};
use crate::error::TxErrc;
use crate::gate::ShutdownGate;
use crate::id_allocator::ProducerIdAllocator;
use crate::lock::TxLocks;
use crate::observability::{TxMetrics, TxStats, TxStatsSnapshot};
use crate::participant::ResourceManager;
use crate::protocol::{
    AddOffsetsReply, AddOffsetsRequest, AddPartitionsReply, AddPartitionsRequest, EndTxnReply,
    EndTxnRequest, InitTxReply, InitTxRequest, PartitionResult, TryAbortReply, TryAbortRequest,
};
use crate::state::{TmTransaction, TxEvent, TxStatus};
use crate::store::{now_ms, TxStore};
use crate::two_phase::{Decision, Participants, Phase, PrepareOutcome};
use crate::types::{
    GroupId, ProducerIdentity, TopicPartition, TransactionalId, TxGroup, TxPartition,
};

/// How long decided fan-out may keep retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    /// On behalf of a waiting request; bounded attempts
    Inline,
    /// Detached; retries until success or shutdown
    Background,
}

pub struct TxCoordinator<P, G> {
    partition: u32,
    config: CoordinatorConfig,
    store: Arc<TxStore>,
    locks: TxLocks,
    participants: Participants<P, G>,
    ids: Arc<dyn ProducerIdAllocator>,
    gate: ShutdownGate,
    stats: TxStats,
}

impl<P, G> TxCoordinator<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    pub fn new(
        partition: u32,
        config: CoordinatorConfig,
        store: Arc<TxStore>,
        partitions: Arc<P>,
        groups: Arc<G>,
        ids: Arc<dyn ProducerIdAllocator>,
    ) -> Self {
        let participants =
            Participants::new(partitions, groups, partition, config.participant_timeout);
        info!(
            partition,
            records = store.len(),
            term = %store.term(),
            "Transaction coordinator started"
        );
        Self {
            partition,
            config,
            store,
            locks: TxLocks::new(),
            participants,
            ids,
            gate: ShutdownGate::new(),
            stats: TxStats::new(),
        }
    }

    /// Coordinator partition served by this instance
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn store(&self) -> &Arc<TxStore> {
        &self.store
    }

    pub fn stats(&self) -> TxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Background tasks still running
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.is_closed()
    }

    // ==================== init_transaction ====================

    /// Register a producer for a transactional id or start its next session
    pub async fn init_transaction(&self, request: InitTxRequest) -> InitTxReply {
        if self.gate.is_closed() {
            return InitTxReply::error(TxErrc::StmNotFound);
        }
        let id = request.transactional_id;
        let timeout = request
            .transaction_timeout
            .unwrap_or(self.config.default_transaction_timeout);

        let result = self
            .locks
            .with_lock(&id, || self.do_init(&id, timeout))
            .await;
        match result {
            Ok(tx) => {
                debug!(tx_id = %id, pid = %tx.pid, tx_seq = %tx.tx_seq, "Producer initialized");
                InitTxReply::ok(tx.pid, tx.tx_seq)
            }
            Err(ec) => {
                warn!(tx_id = %id, error = %ec, "init_transaction failed");
                InitTxReply::error(ec)
            }
        }
    }

    async fn do_init(&self, id: &str, timeout: Duration) -> Result<TmTransaction, TxErrc> {
        self.barrier().await?;

        let Some(tx) = self.store.get(id) else {
            let pid = ProducerIdentity::new(self.ids.allocate_id().await?, 0);
            let tx = self.store.register_new_producer(id, pid, timeout).await?;
            info!(tx_id = %id, pid = %pid, "Registered transactional producer");
            return Ok(tx);
        };

        if tx.status == TxStatus::Ongoing {
            if self.store.is_actual_term(tx.etag) {
                return Ok(tx);
            }
            warn!(tx_id = %id, etag = %tx.etag, term = %self.store.term(), "Ongoing transaction from an earlier term");
            return Err(TxErrc::RequestRejected);
        }

        let tx = self.settle(tx).await?;
        let next = self.next_identity(tx.pid).await?;
        Ok(self.store.re_register_producer(&tx, next, timeout).await?)
    }

    // ==================== add_partitions / add_offsets ====================

    /// Register partitions in the ongoing transaction of a producer
    pub async fn add_partitions(&self, request: AddPartitionsRequest) -> AddPartitionsReply {
        if self.gate.is_closed() {
            return AddPartitionsReply::error(&request.partitions, TxErrc::StmNotFound);
        }
        let result = self
            .locks
            .with_lock(&request.transactional_id, || self.do_add_partitions(&request))
            .await;
        match result {
            Ok(reply) => reply,
            Err(ec) => {
                warn!(tx_id = %request.transactional_id, pid = %request.pid, error = %ec, "add_partitions failed");
                AddPartitionsReply::error(&request.partitions, ec)
            }
        }
    }

    async fn do_add_partitions(
        &self,
        request: &AddPartitionsRequest,
    ) -> Result<AddPartitionsReply, TxErrc> {
        let tx = self
            .admit(&request.transactional_id, &request.pid)
            .await?;

        let mut fresh: Vec<TopicPartition> = Vec::new();
        for tp in &request.partitions {
            if !tx.has_partition(tp) && !fresh.contains(tp) {
                fresh.push(tp.clone());
            }
        }

        let mut failed: Vec<(TopicPartition, TxErrc)> = Vec::new();
        let mut begun: Vec<TxPartition> = Vec::new();
        for (tp, result) in self.participants.begin_partitions(&tx, fresh).await {
            match result {
                Ok(etag) => begun.push(TxPartition { tp, etag }),
                Err(ec) => {
                    warn!(tx_id = %tx.id, partition = %tp, error = %ec, "begin_tx failed");
                    failed.push((tp, participant_error(ec)));
                }
            }
        }

        if !begun.is_empty() {
            let was_ready = tx.status == TxStatus::Ready;
            match self.store.add_partitions(&tx, begun.clone()).await {
                Ok(updated) => {
                    if was_ready {
                        self.stats.record_start();
                    }
                    debug!(tx_id = %tx.id, partitions = updated.partitions.len(), "Partitions added");
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "Failed to persist partitions");
                    failed.extend(begun.into_iter().map(|p| (p.tp, TxErrc::UnknownServerError)));
                }
            }
        }

        let results = request
            .partitions
            .iter()
            .map(|tp| PartitionResult {
                partition: tp.clone(),
                error_code: failed
                    .iter()
                    .find(|(failed_tp, _)| failed_tp == tp)
                    .map(|(_, ec)| *ec)
                    .unwrap_or(TxErrc::None),
            })
            .collect();
        Ok(AddPartitionsReply { results })
    }

    /// Register a consumer group in the ongoing transaction of a producer
    pub async fn add_offsets(&self, request: AddOffsetsRequest) -> AddOffsetsReply {
        if self.gate.is_closed() {
            return AddOffsetsReply {
                error_code: TxErrc::StmNotFound,
            };
        }
        let result = self
            .locks
            .with_lock(&request.transactional_id, || self.do_add_offsets(&request))
            .await;
        let error_code = match result {
            Ok(()) => TxErrc::None,
            Err(ec) => {
                warn!(tx_id = %request.transactional_id, group = %request.group_id, error = %ec, "add_offsets failed");
                ec
            }
        };
        AddOffsetsReply { error_code }
    }

    async fn do_add_offsets(&self, request: &AddOffsetsRequest) -> Result<(), TxErrc> {
        let tx = self
            .admit(&request.transactional_id, &request.pid)
            .await?;
        if tx.has_group(&request.group_id) {
            return Ok(());
        }

        let etag = self
            .participants
            .begin_group(&tx, &request.group_id)
            .await
            .map_err(participant_error)?;
        let group = TxGroup {
            group_id: request.group_id.clone(),
            etag,
        };
        self.store.add_group(&tx, group).await?;
        if tx.status == TxStatus::Ready {
            self.stats.record_start();
        }
        debug!(tx_id = %tx.id, group = %request.group_id, "Consumer group added");
        Ok(())
    }

    /// Load a settled record and check it accepts new resources from `pid`
    async fn admit(&self, id: &str, pid: &ProducerIdentity) -> Result<TmTransaction, TxErrc> {
        self.barrier().await?;
        let tx = self.store.get(id).ok_or(TxErrc::RequestRejected)?;
        let tx = self.settle(tx).await?;
        self.check_producer(&tx, pid)?;

        match tx.status {
            TxStatus::Ready | TxStatus::Ongoing if self.store.is_actual_term(tx.etag) => Ok(tx),
            TxStatus::Ready | TxStatus::Ongoing => {
                warn!(tx_id = %id, status = %tx.status, etag = %tx.etag, term = %self.store.term(), "Transaction state from an earlier term, abort required");
                Err(TxErrc::RequestRejected)
            }
            _ => Err(TxErrc::RequestRejected),
        }
    }

    // ==================== end_transaction ====================

    /// Commit or abort the current transaction of a producer
    ///
    /// Returns once the outcome is decided; fan-out may still be running.
    pub async fn end_transaction(self: &Arc<Self>, request: EndTxnRequest) -> EndTxnReply {
        let started = Instant::now();
        let (decision, reply) = Decision::channel();

        let this = Arc::clone(self);
        let spawned = self.gate.spawn(async move {
            let mut decision = decision;
            let _guard = this.locks.acquire(&request.transactional_id).await;
            if let Err(ec) = this.do_end_txn(&request, &mut decision).await {
                debug!(tx_id = %request.transactional_id, error = %ec, "end_transaction finished with error");
            }
        });
        if spawned.is_none() {
            return EndTxnReply::error(TxErrc::StmNotFound);
        }

        let reply = reply
            .await
            .unwrap_or_else(|_| EndTxnReply::error(TxErrc::UnknownServerError));
        TxMetrics::record_end_latency(started.elapsed());
        reply
    }

    async fn do_end_txn(
        &self,
        request: &EndTxnRequest,
        decision: &mut Decision,
    ) -> Result<(), TxErrc> {
        self.barrier().await.map_err(|ec| decision.fail(ec))?;

        let tx = self
            .store
            .get(&request.transactional_id)
            .ok_or_else(|| decision.fail(TxErrc::RequestRejected))?;
        let tx = self.settle(tx).await.map_err(|ec| decision.fail(ec))?;

        if !tx.is_attempt(&request.pid, request.tx_seq) {
            let reply = self.replay_end(&tx, request);
            decision.decide(reply);
            return reply.error_code.into_result();
        }

        if !request.committed {
            return self.abort_tm_tx(tx, decision).await;
        }

        match tx.status {
            TxStatus::Ongoing if self.store.is_actual_term(tx.etag) => {
                self.commit_tm_tx(tx, decision, Drive::Background)
                    .await
                    .map(|_| ())
            }
            TxStatus::Ongoing => {
                warn!(tx_id = %tx.id, etag = %tx.etag, "Refusing to commit a transaction from an earlier term");
                Err(decision.fail(TxErrc::RequestRejected))
            }
            _ => Err(decision.fail(TxErrc::RequestRejected)),
        }
    }

    /// Answer an end request that does not name the current attempt
    fn replay_end(&self, tx: &TmTransaction, request: &EndTxnRequest) -> EndTxnReply {
        if let Some(outcome) = tx.outcome_of(&request.pid, request.tx_seq) {
            return if outcome.committed == request.committed {
                EndTxnReply::ok(tx.pid, tx.tx_seq)
            } else {
                EndTxnReply::error(TxErrc::RequestRejected)
            };
        }
        if let Err(ec) = self.check_producer(tx, &request.pid) {
            return EndTxnReply::error(ec);
        }
        if request.tx_seq < tx.tx_seq {
            self.stats.record_fenced();
            EndTxnReply::error(TxErrc::Fenced)
        } else {
            EndTxnReply::error(TxErrc::RequestRejected)
        }
    }

    /// Prepare, decide and commit; `tx` is `ongoing` or `preparing`
    async fn commit_tm_tx(
        &self,
        tx: TmTransaction,
        decision: &mut Decision,
        drive: Drive,
    ) -> Result<TmTransaction, TxErrc> {
        let next = self
            .next_identity(tx.pid)
            .await
            .map_err(|ec| decision.fail(ec))?;

        let tx = match tx.status {
            TxStatus::Ongoing => self
                .store
                .transition(&tx, TxEvent::Commit)
                .await
                .map_err(|e| decision.fail(e.into()))?,
            TxStatus::Preparing => tx,
            _ => return Err(decision.fail(TxErrc::RequestRejected)),
        };

        match self.participants.prepare(&tx).await {
            PrepareOutcome::Prepared => {}
            PrepareOutcome::Rejected => {
                TxMetrics::increment_rejected();
                let killed = self
                    .store
                    .transition(&tx, TxEvent::PrepareRejected)
                    .await
                    .map_err(|e| decision.fail(e.into()))?;
                info!(tx_id = %tx.id, pid = %tx.pid, "Prepare rejected, aborting transaction");
                decision.fail(TxErrc::RequestRejected);
                return self.finish_decided(killed, Some(next), drive).await;
            }
            PrepareOutcome::Failed(ec) => {
                warn!(tx_id = %tx.id, pid = %tx.pid, error = %ec, "Prepare incomplete, transaction left preparing");
                return Err(decision.fail(TxErrc::UnknownServerError));
            }
        }

        let prepared = self
            .store
            .transition(&tx, TxEvent::PrepareSucceeded)
            .await
            .map_err(|e| decision.fail(e.into()))?;
        debug!(tx_id = %tx.id, pid = %tx.pid, tx_seq = %tx.tx_seq, "Transaction prepared");
        decision.decide(EndTxnReply::ok(next, prepared.tx_seq.next()));

        self.finish_decided(prepared, Some(next), drive).await
    }

    async fn abort_tm_tx(&self, tx: TmTransaction, decision: &mut Decision) -> Result<(), TxErrc> {
        match tx.status {
            TxStatus::Ready if self.store.is_actual_term(tx.etag) => {
                Err(decision.fail(TxErrc::RequestRejected))
            }
            TxStatus::Ready => {
                let tx = self
                    .store
                    .transition(&tx, TxEvent::Refresh)
                    .await
                    .map_err(|e| decision.fail(e.into()))?;
                debug!(tx_id = %tx.id, etag = %tx.etag, "Refreshed idle transaction under current term");
                decision.decide(EndTxnReply::ok(tx.pid, tx.tx_seq));
                Ok(())
            }
            TxStatus::Ongoing => {
                let next = self
                    .next_identity(tx.pid)
                    .await
                    .map_err(|ec| decision.fail(ec))?;
                let aborting = self
                    .store
                    .transition(&tx, TxEvent::Abort)
                    .await
                    .map_err(|e| decision.fail(e.into()))?;
                decision.decide(EndTxnReply::ok(next, aborting.tx_seq.next()));
                self.finish_decided(aborting, Some(next), Drive::Background)
                    .await
                    .map(|_| ())
            }
            _ => Err(decision.fail(TxErrc::RequestRejected)),
        }
    }

    /// Run the second phase of a decided record and reset it to `ready`
    async fn finish_decided(
        &self,
        tx: TmTransaction,
        next: Option<ProducerIdentity>,
        drive: Drive,
    ) -> Result<TmTransaction, TxErrc> {
        let phase = if tx.status == TxStatus::Prepared {
            Phase::Commit
        } else {
            Phase::Abort
        };

        self.participants
            .drive(&tx, phase, &self.retry_for(drive), &self.gate)
            .await?;

        let next = match next {
            Some(next) => next,
            None => self.next_identity(tx.pid).await?,
        };
        let done = self.store.finish(&tx, next).await?;
        match phase {
            Phase::Commit => self.stats.record_commit(),
            Phase::Abort => self.stats.record_abort(),
        }
        debug!(tx_id = %tx.id, pid = %tx.pid, tx_seq = %tx.tx_seq, ?phase, next_pid = %next, "Transaction completed");
        Ok(done)
    }

    /// Complete whatever phase `tx` was left in
    async fn complete(
        &self,
        tx: TmTransaction,
        decision: &mut Decision,
        drive: Drive,
    ) -> Result<TmTransaction, TxErrc> {
        match tx.status {
            TxStatus::Preparing => self.commit_tm_tx(tx, decision, drive).await,
            TxStatus::Prepared | TxStatus::Aborting | TxStatus::Killed => {
                self.finish_decided(tx, None, drive).await
            }
            TxStatus::Ready | TxStatus::Ongoing => Ok(tx),
        }
    }

    /// Roll an unfinished record forward before admitting a new operation
    async fn settle(&self, tx: TmTransaction) -> Result<TmTransaction, TxErrc> {
        if !tx.status.needs_rollforward() {
            return Ok(tx);
        }
        info!(tx_id = %tx.id, pid = %tx.pid, status = %tx.status, "Rolling forward unfinished transaction");
        self.stats.record_rollforward();
        let mut decision = Decision::detached();
        self.complete(tx, &mut decision, Drive::Inline).await
    }

    // ==================== try_abort ====================

    /// Outcome query from a participant unsure about a prepared transaction
    ///
    /// Never waits for fan-out: an undecided transaction answers "pending"
    /// and is driven in the background. Never waits for the id's lock
    /// either; a participant told "aborted" refuses a later prepare, so
    /// killing an ongoing record only needs the lock when it is free.
    pub async fn try_abort(self: &Arc<Self>, request: TryAbortRequest) -> TryAbortReply {
        if self.gate.is_closed() {
            return TryAbortReply::error(TxErrc::StmNotFound);
        }
        if request.tm_partition != self.partition {
            return TryAbortReply::error(TxErrc::NotCoordinator);
        }
        if let Err(ec) = self.barrier().await {
            return TryAbortReply::error(ec);
        }

        // unknown transactions cannot have been committed
        let Some(id) = self.store.get_id_by_pid(&request.pid) else {
            return TryAbortReply::aborted();
        };
        let Some(tx) = self.store.get(&id) else {
            return TryAbortReply::aborted();
        };

        if !tx.is_attempt(&request.pid, request.tx_seq) {
            return match tx.outcome_of(&request.pid, request.tx_seq) {
                Some(outcome) if outcome.committed => TryAbortReply::committed(),
                Some(_) => TryAbortReply::aborted(),
                None => TryAbortReply::error(TxErrc::RequestRejected),
            };
        }

        match tx.status {
            TxStatus::Prepared => {
                self.spawn_rollforward(&id);
                TryAbortReply::committed()
            }
            TxStatus::Aborting | TxStatus::Killed => {
                self.spawn_rollforward(&id);
                TryAbortReply::aborted()
            }
            TxStatus::Ready => TryAbortReply::aborted(),
            TxStatus::Preparing => {
                self.spawn_rollforward(&id);
                TryAbortReply::pending()
            }
            TxStatus::Ongoing => self.kill(tx).await,
        }
    }

    /// Abort an ongoing transaction on behalf of a participant
    async fn kill(self: &Arc<Self>, tx: TmTransaction) -> TryAbortReply {
        let Some(guard) = self.locks.try_acquire(&tx.id) else {
            return TryAbortReply::pending();
        };
        match self.store.get(&tx.id) {
            Some(current) if current == tx => {}
            _ => return TryAbortReply::pending(),
        }

        match self.store.transition(&tx, TxEvent::Kill).await {
            Ok(_) => {
                info!(tx_id = %tx.id, pid = %tx.pid, "Transaction killed by try_abort");
                drop(guard);
                self.spawn_rollforward(&tx.id);
                TryAbortReply::aborted()
            }
            Err(e) => {
                warn!(tx_id = %tx.id, error = %e, "Failed to kill transaction");
                TryAbortReply::error(TxErrc::UnknownServerError)
            }
        }
    }

    /// Drive an unfinished record in the background unless someone already is
    fn spawn_rollforward(self: &Arc<Self>, id: &str) {
        if self.locks.is_locked(id) {
            return;
        }
        let this = Arc::clone(self);
        let id: TransactionalId = id.to_string();
        self.gate.spawn(async move {
            let _guard = this.locks.acquire(&id).await;
            let Some(tx) = this.store.get(&id) else {
                return;
            };
            if !tx.status.needs_rollforward() {
                return;
            }
            this.stats.record_rollforward();
            let mut decision = Decision::detached();
            if let Err(ec) = this.complete(tx, &mut decision, Drive::Background).await {
                debug!(tx_id = %id, error = %ec, "Background rollforward stopped");
            }
        });
    }

    // ==================== Maintenance ====================

    /// Abort ongoing transactions whose timeout elapsed; returns how many
    pub async fn expire_timed_out(&self) -> usize {
        let now = now_ms();
        let candidates: Vec<TransactionalId> = self
            .store
            .records_in(TxStatus::Ongoing)
            .into_iter()
            .filter(|tx| tx.is_expired(now))
            .map(|tx| tx.id)
            .collect();

        let mut expired = 0;
        for id in candidates {
            // whoever holds the lock is already working on the record
            let Some(_guard) = self.locks.try_acquire(&id) else {
                continue;
            };
            let Some(tx) = self.store.get(&id) else {
                continue;
            };
            if !tx.is_expired(now_ms()) {
                continue;
            }
            let killed = match self.store.transition(&tx, TxEvent::Kill).await {
                Ok(killed) => killed,
                Err(e) => {
                    warn!(tx_id = %id, error = %e, "Failed to expire transaction");
                    continue;
                }
            };
            expired += 1;
            self.stats.record_expired();
            info!(tx_id = %id, pid = %tx.pid, timeout = ?tx.timeout, "Transaction timed out");
            if let Err(ec) = self.finish_decided(killed, None, Drive::Inline).await {
                warn!(tx_id = %id, error = %ec, "Abort of expired transaction incomplete");
            }
        }
        expired
    }

    /// Complete every unfinished record nobody is working on
    pub async fn rollforward_pending(&self) -> usize {
        let candidates: Vec<TransactionalId> = [
            TxStatus::Preparing,
            TxStatus::Prepared,
            TxStatus::Aborting,
            TxStatus::Killed,
        ]
        .into_iter()
        .flat_map(|status| self.store.records_in(status))
        .map(|tx| tx.id)
        .collect();

        let mut completed = 0;
        for id in candidates {
            let Some(_guard) = self.locks.try_acquire(&id) else {
                continue;
            };
            let Some(tx) = self.store.get(&id) else {
                continue;
            };
            match self.settle(tx).await {
                Ok(_) => completed += 1,
                Err(ec) => debug!(tx_id = %id, error = %ec, "Rollforward incomplete"),
            }
        }
        completed
    }

    /// Periodically expire timed out transactions and finish unfinished ones
    pub fn start_expiry_sweeper(self: &Arc<Self>) -> bool {
        let this = Arc::clone(self);
        let period = self.config.tx_timeout_delay;
        self.gate
            .spawn(async move {
                while this.gate.sleep(period).await {
                    let expired = this.expire_timed_out().await;
                    let rolled = this.rollforward_pending().await;
                    if expired + rolled > 0 {
                        debug!(expired, rolled, "Transaction sweep");
                    }
                }
            })
            .is_some()
    }

    /// Stop accepting work and wait for background fan-out to finish
    ///
    /// Retry sleeps are interrupted; transactions left decided are rolled
    /// forward by whichever coordinator serves their id next.
    pub async fn stop(&self) {
        info!(
            partition = self.partition,
            in_flight = self.gate.in_flight(),
            "Stopping transaction coordinator"
        );
        self.gate.close().await;
        info!(partition = self.partition, "Transaction coordinator stopped");
    }

    // ==================== Helpers ====================

    async fn barrier(&self) -> Result<(), TxErrc> {
        self.store
            .barrier(self.config.tm_sync_timeout)
            .await
            .map_err(|e| {
                warn!(partition = self.partition, error = %e, "Coordinator log barrier failed");
                TxErrc::from(e)
            })
    }

    /// `pid` may act on `tx`; stale sessions are fenced
    fn check_producer(&self, tx: &TmTransaction, pid: &ProducerIdentity) -> Result<(), TxErrc> {
        if tx.pid == *pid {
            return Ok(());
        }
        let replaced = |old: ProducerIdentity| old == *pid || old.supersedes(pid);
        let superseded = tx.pid.supersedes(pid)
            || tx.last_outcome.is_some_and(|last| replaced(last.pid))
            || tx.previous_pid.is_some_and(replaced);
        if superseded {
            self.stats.record_fenced();
            debug!(tx_id = %tx.id, current = %tx.pid, stale = %pid, "Producer fenced");
            Err(TxErrc::Fenced)
        } else {
            Err(TxErrc::RequestRejected)
        }
    }

    /// Identity for the session after `pid`
    async fn next_identity(&self, pid: ProducerIdentity) -> Result<ProducerIdentity, TxErrc> {
        if let Some(next) = pid.bump_epoch() {
            return Ok(next);
        }
        let id = self.ids.allocate_id().await?;
        info!(old = %pid, new_id = id, "Producer epoch exhausted, allocated new producer id");
        Ok(ProducerIdentity::new(id, 0))
    }

    fn retry_for(&self, drive: Drive) -> RetryConfig {
        match drive {
            Drive::Inline => self
                .config
                .rollforward
                .bounded(self.config.sync_rollforward_attempts.max(1)),
            Drive::Background => self.config.rollforward.clone(),
        }
    }
}

/// Participant failures on an undecided path
fn participant_error(ec: TxErrc) -> TxErrc {
    match ec {
        TxErrc::PartitionNotFound | TxErrc::Fenced => ec,
        _ => TxErrc::UnknownServerError,
    }
}
