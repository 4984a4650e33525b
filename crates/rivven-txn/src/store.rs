//! Transaction record store
//!
//! In-memory map of [`TmTransaction`] records backed by a [`TxLog`]. The only
//! mutation path is [`TxStore::apply_if`]: validate the current record,
//! append the mutated record to the log, then apply it. Writes to one id
//! are serialized; writes to different ids append concurrently.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::lock::TxLocks;
use crate::log::{LogEntry, TxLog, TxSnapshot};
use crate::state::{TmTransaction, TxEvent, TxStatus};
use crate::types::{ProducerIdentity, Term, TransactionalId, TxGroup, TxPartition};

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct TxStore {
    log: Arc<dyn TxLog>,
    records: RwLock<HashMap<TransactionalId, TmTransaction>>,
    /// Producer id to transactional id; ids replaced after epoch
    /// exhaustion keep pointing at their record
    by_pid: RwLock<HashMap<i64, TransactionalId>>,
    /// Held from the `expected` check until the record is installed
    writers: TxLocks,
    /// Shared by appends, exclusive while a snapshot is taken
    appends: tokio::sync::RwLock<()>,
    /// Highest offset installed; with no append in flight every entry up
    /// to it is reflected in `records`
    last_offset: Mutex<Option<u64>>,
}

impl std::fmt::Debug for TxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxStore")
            .field("records", &self.len())
            .field("term", &self.term())
            .finish()
    }
}

impl TxStore {
    /// Empty store over `log`
    pub fn new(log: Arc<dyn TxLog>) -> Self {
        Self {
            log,
            records: RwLock::new(HashMap::new()),
            by_pid: RwLock::new(HashMap::new()),
            writers: TxLocks::new(),
            appends: tokio::sync::RwLock::new(()),
            last_offset: Mutex::new(None),
        }
    }

    /// Rebuild the store from the log's snapshot and the entries after it
    pub async fn recover(log: Arc<dyn TxLog>) -> Result<Self, StoreError> {
        let replay = log.replay().await?;
        let store = Self::new(log);

        if let Some(bytes) = replay.snapshot {
            let snapshot = TxSnapshot::decode(&bytes)?;
            for record in snapshot.records {
                store.install(record);
            }
            *store.last_offset.lock() = snapshot.last_offset;
        }

        let replayed = replay.entries.len();
        for (offset, bytes) in replay.entries {
            let entry = LogEntry::decode(&bytes)?;
            store.install(entry.record);
            *store.last_offset.lock() = Some(offset);
        }

        info!(
            records = store.len(),
            replayed,
            term = %store.term(),
            "Recovered transaction store"
        );
        Ok(store)
    }

    pub fn term(&self) -> Term {
        self.log.term()
    }

    /// `etag` was written under the current leadership term
    pub fn is_actual_term(&self, etag: Term) -> bool {
        etag == self.term()
    }

    /// Fails unless this replica leads the current term with its state caught up
    pub async fn barrier(&self, timeout: Duration) -> Result<(), StoreError> {
        self.log.barrier(timeout).await?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TmTransaction> {
        self.records.read().get(id).cloned()
    }

    /// Transactional id whose record was registered for `pid.id`
    pub fn get_id_by_pid(&self, pid: &ProducerIdentity) -> Option<TransactionalId> {
        self.by_pid.read().get(&pid.id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in the given status
    pub fn records_in(&self, status: TxStatus) -> Vec<TmTransaction> {
        self.records
            .read()
            .values()
            .filter(|tx| tx.status == status)
            .cloned()
            .collect()
    }

    /// Conditionally mutate the record of `id`
    ///
    /// `expected` sees the current record (or `None`); when it holds,
    /// `mutate` builds the next record, which is appended to the log and
    /// then applied. Nothing is applied if the append fails. Only writers
    /// of the same id wait for each other.
    pub async fn apply_if<P, M>(
        &self,
        id: &str,
        expected: P,
        mutate: M,
    ) -> Result<TmTransaction, StoreError>
    where
        P: FnOnce(Option<&TmTransaction>) -> bool,
        M: FnOnce(Option<TmTransaction>) -> Result<TmTransaction, StoreError>,
    {
        let _append = self.appends.read().await;
        self.writers
            .with_lock(id, || async move {
                let current = self.get(id);
                if !expected(current.as_ref()) {
                    return Err(StoreError::Conflict(id.to_string()));
                }

                let mut next = mutate(current)?;
                next.id = id.to_string();
                next.updated_at_ms = now_ms();

                let bytes = LogEntry {
                    record: next.clone(),
                }
                .encode()?;
                let offset = self.log.append(bytes).await?;

                self.install(next.clone());
                {
                    let mut last = self.last_offset.lock();
                    *last = Some(last.map_or(offset, |prev| prev.max(offset)));
                }
                Ok(next)
            })
            .await
    }

    fn install(&self, record: TmTransaction) {
        {
            let mut by_pid = self.by_pid.write();
            if let Some(previous) = record.previous_pid {
                by_pid.insert(previous.id, record.id.clone());
            }
            by_pid.insert(record.pid.id, record.id.clone());
        }
        self.records.write().insert(record.id.clone(), record);
    }

    /// Write a snapshot of every record to the log
    ///
    /// Waits for in-flight appends so the snapshot covers every entry up
    /// to its offset.
    pub async fn snapshot(&self) -> Result<TxSnapshot, StoreError> {
        let _appends = self.appends.write().await;

        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = TxSnapshot {
            last_offset: *self.last_offset.lock(),
            records,
        };

        if let Some(offset) = snapshot.last_offset {
            self.log.write_snapshot(snapshot.encode()?, offset).await?;
            debug!(offset, records = snapshot.records.len(), "Wrote transaction snapshot");
        }
        Ok(snapshot)
    }

    // ==================== Mutations ====================

    /// First registration of a transactional id
    pub async fn register_new_producer(
        &self,
        id: &str,
        pid: ProducerIdentity,
        timeout: Duration,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(
            id,
            |current| current.is_none(),
            |_| Ok(TmTransaction::new(id, pid, timeout, term)),
        )
        .await
    }

    /// Re-initialize a `ready` record with a new producer identity
    pub async fn re_register_producer(
        &self,
        tx: &TmTransaction,
        pid: ProducerIdentity,
        timeout: Duration,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(&tx.id, same_attempt(tx), |current| {
            let mut next = existing(&tx.id, current)?;
            next.transition(TxEvent::Reregister, term)?;
            next.set_pid(pid);
            next.timeout = timeout;
            Ok(next)
        })
        .await
    }

    /// Apply a status event to the attempt described by `tx`
    pub async fn transition(
        &self,
        tx: &TmTransaction,
        event: TxEvent,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(&tx.id, same_attempt(tx), |current| {
            let mut next = existing(&tx.id, current)?;
            next.transition(event, term)?;
            Ok(next)
        })
        .await
    }

    /// Register partitions, moving a `ready` record to `ongoing`
    pub async fn add_partitions(
        &self,
        tx: &TmTransaction,
        partitions: Vec<TxPartition>,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(&tx.id, same_attempt(tx), |current| {
            let mut next = existing(&tx.id, current)?;
            next.transition(TxEvent::AddResource, term)?;
            for partition in partitions {
                if !next.has_partition(&partition.tp) {
                    next.partitions.push(partition);
                }
            }
            Ok(next)
        })
        .await
    }

    /// Register a consumer group, moving a `ready` record to `ongoing`
    pub async fn add_group(
        &self,
        tx: &TmTransaction,
        group: TxGroup,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(&tx.id, same_attempt(tx), |current| {
            let mut next = existing(&tx.id, current)?;
            next.transition(TxEvent::AddResource, term)?;
            if !next.has_group(&group.group_id) {
                next.groups.push(group);
            }
            Ok(next)
        })
        .await
    }

    /// Complete a decided transaction and reset the record for the next one
    pub async fn finish(
        &self,
        tx: &TmTransaction,
        next_pid: ProducerIdentity,
    ) -> Result<TmTransaction, StoreError> {
        let term = self.term();
        self.apply_if(&tx.id, same_attempt(tx), |current| {
            let mut next = existing(&tx.id, current)?;
            next.finish(next_pid, term)?;
            Ok(next)
        })
        .await
    }
}

/// The record is still the attempt (and status) `tx` was read as
fn same_attempt(tx: &TmTransaction) -> impl FnOnce(Option<&TmTransaction>) -> bool {
    let (pid, tx_seq, status) = (tx.pid, tx.tx_seq, tx.status);
    move |current| current.is_some_and(|c| c.is_attempt(&pid, tx_seq) && c.status == status)
}

fn existing(id: &str, current: Option<TmTransaction>) -> Result<TmTransaction, StoreError> {
    current.ok_or_else(|| StoreError::NotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogError;
    use crate::log::{InMemoryTxLog, LogReplay};
    use crate::types::{TopicPartition, TxSeq};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Notify;

    const TIMEOUT: Duration = Duration::from_secs(60);

    /// Log whose appends for the record `slow` wait until released
    #[derive(Default)]
    struct GatedLog {
        inner: InMemoryTxLog,
        release: Notify,
    }

    #[async_trait]
    impl TxLog for GatedLog {
        fn term(&self) -> Term {
            self.inner.term()
        }

        fn is_leader(&self) -> bool {
            self.inner.is_leader()
        }

        async fn append(&self, entry: Bytes) -> Result<u64, LogError> {
            if LogEntry::decode(&entry)?.record.id == "slow" {
                self.release.notified().await;
            }
            self.inner.append(entry).await
        }

        async fn barrier(&self, timeout: Duration) -> Result<(), LogError> {
            self.inner.barrier(timeout).await
        }

        async fn replay(&self) -> Result<LogReplay, LogError> {
            self.inner.replay().await
        }

        async fn write_snapshot(&self, snapshot: Bytes, last_offset: u64) -> Result<(), LogError> {
            self.inner.write_snapshot(snapshot, last_offset).await
        }
    }

    fn partition(topic: &str, p: u32) -> TxPartition {
        TxPartition {
            tp: TopicPartition::new(topic, p),
            etag: Term(1),
        }
    }

    async fn registered(store: &TxStore) -> TmTransaction {
        store
            .register_new_producer("t1", ProducerIdentity::new(1, 0), TIMEOUT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_once() {
        let store = TxStore::new(Arc::new(InMemoryTxLog::new()));
        let tx = registered(&store).await;
        assert_eq!(tx.status, TxStatus::Ready);
        assert_eq!(tx.etag, Term(1));
        assert_eq!(store.get_id_by_pid(&tx.pid).as_deref(), Some("t1"));

        let again = store
            .register_new_producer("t1", ProducerIdentity::new(2, 0), TIMEOUT)
            .await;
        assert_eq!(again, Err(StoreError::Conflict("t1".into())));
    }

    #[tokio::test]
    async fn test_stale_attempt_conflicts() {
        let store = TxStore::new(Arc::new(InMemoryTxLog::new()));
        let tx = registered(&store).await;
        let ongoing = store
            .add_partitions(&tx, vec![partition("orders", 0)])
            .await
            .unwrap();
        assert_eq!(ongoing.status, TxStatus::Ongoing);

        // `tx` was read while the record was still ready
        let result = store.transition(&tx, TxEvent::Commit).await;
        assert_eq!(result, Err(StoreError::Conflict("t1".into())));
        assert_eq!(store.get("t1").unwrap().status, TxStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_invalid_transition_not_applied() {
        let store = TxStore::new(Arc::new(InMemoryTxLog::new()));
        let tx = registered(&store).await;
        let result = store.transition(&tx, TxEvent::Commit).await;
        assert!(matches!(result, Err(StoreError::Transition(_))));
        assert_eq!(store.get("t1").unwrap(), tx);
    }

    #[tokio::test]
    async fn test_add_partitions_dedupes() {
        let store = TxStore::new(Arc::new(InMemoryTxLog::new()));
        let tx = registered(&store).await;
        let tx = store
            .add_partitions(&tx, vec![partition("orders", 0), partition("orders", 1)])
            .await
            .unwrap();
        let tx = store
            .add_partitions(&tx, vec![partition("orders", 1), partition("orders", 2)])
            .await
            .unwrap();
        assert_eq!(tx.partitions.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_record() {
        let log = Arc::new(InMemoryTxLog::new());
        let store = TxStore::new(log.clone());
        let tx = registered(&store).await;

        log.fail_next_appends(1);
        let result = store.add_partitions(&tx, vec![partition("orders", 0)]).await;
        assert!(matches!(
            result,
            Err(StoreError::Unavailable(LogError::Unavailable(_)))
        ));
        assert_eq!(store.get("t1").unwrap().status, TxStatus::Ready);
    }

    #[tokio::test]
    async fn test_finish_and_recover() {
        let log = Arc::new(InMemoryTxLog::new());
        let store = TxStore::new(log.clone());
        let tx = registered(&store).await;
        let tx = store
            .add_partitions(&tx, vec![partition("orders", 0)])
            .await
            .unwrap();
        let tx = store.transition(&tx, TxEvent::Abort).await.unwrap();
        let tx = store
            .finish(&tx, ProducerIdentity::new(1, 1))
            .await
            .unwrap();
        assert_eq!(tx.tx_seq, TxSeq(1));

        let recovered = TxStore::recover(log).await.unwrap();
        assert_eq!(recovered.get("t1"), Some(tx));
    }

    #[tokio::test]
    async fn test_snapshot_then_recover() {
        let log = Arc::new(InMemoryTxLog::new());
        let store = TxStore::new(log.clone());
        let tx = registered(&store).await;
        store.snapshot().await.unwrap();
        assert!(log.is_empty());

        let tx = store
            .add_partitions(&tx, vec![partition("orders", 0)])
            .await
            .unwrap();
        store
            .register_new_producer("t2", ProducerIdentity::new(2, 0), TIMEOUT)
            .await
            .unwrap();

        let recovered = TxStore::recover(log).await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.get("t1"), Some(tx));
        assert_eq!(
            recovered.get_id_by_pid(&ProducerIdentity::new(2, 0)).as_deref(),
            Some("t2")
        );
    }

    #[tokio::test]
    async fn test_term_change() {
        let log = Arc::new(InMemoryTxLog::new());
        let store = TxStore::new(log.clone());
        let tx = registered(&store).await;
        assert!(store.is_actual_term(tx.etag));

        log.elect(Term(2));
        assert!(!store.is_actual_term(tx.etag));
        let tx = store
            .re_register_producer(&tx, ProducerIdentity::new(1, 1), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(tx.etag, Term(2));
    }

    #[tokio::test]
    async fn test_pending_append_does_not_block_other_ids() {
        let log = Arc::new(GatedLog::default());
        let store = Arc::new(TxStore::new(log.clone()));

        let slow = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .register_new_producer("slow", ProducerIdentity::new(1, 0), TIMEOUT)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fast = tokio::time::timeout(
            Duration::from_millis(500),
            store.register_new_producer("fast", ProducerIdentity::new(2, 0), TIMEOUT),
        )
        .await
        .expect("write to another id completes")
        .unwrap();
        assert_eq!(fast.status, TxStatus::Ready);
        assert!(store.get("slow").is_none());

        // a snapshot waits for the pending append it would otherwise cover
        let snapshot = tokio::spawn({
            let store = store.clone();
            async move { store.snapshot().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!snapshot.is_finished());

        log.release.notify_one();
        slow.await.unwrap().unwrap();
        let snapshot = snapshot.await.unwrap().unwrap();
        assert_eq!(snapshot.last_offset, Some(1));
        assert_eq!(snapshot.records.len(), 2);

        let recovered = TxStore::recover(log).await.unwrap();
        assert_eq!(recovered.len(), 2);
    }

    #[tokio::test]
    async fn test_same_id_writers_wait_for_each_other() {
        let log = Arc::new(GatedLog::default());
        let store = Arc::new(TxStore::new(log.clone()));

        let register = |pid: ProducerIdentity| {
            let store = store.clone();
            tokio::spawn(async move { store.register_new_producer("slow", pid, TIMEOUT).await })
        };
        let first = register(ProducerIdentity::new(1, 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = register(ProducerIdentity::new(2, 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        log.release.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(
            second.await.unwrap(),
            Err(StoreError::Conflict("slow".into()))
        );
        assert_eq!(
            store.get("slow").map(|tx| tx.pid),
            Some(ProducerIdentity::new(1, 0))
        );
    }

    #[tokio::test]
    async fn test_recover_keeps_previous_producer_id() {
        let log = Arc::new(InMemoryTxLog::new());
        let store = TxStore::new(log.clone());
        let tx = registered(&store).await;
        store
            .re_register_producer(&tx, ProducerIdentity::new(5, 0), TIMEOUT)
            .await
            .unwrap();
        store.snapshot().await.unwrap();

        let recovered = TxStore::recover(log).await.unwrap();
        assert_eq!(
            recovered.get_id_by_pid(&ProducerIdentity::new(1, 0)).as_deref(),
            Some("t1")
        );
        assert_eq!(
            recovered.get("t1").and_then(|tx| tx.previous_pid),
            Some(ProducerIdentity::new(1, 0))
        );
    }
}
