//! Shared harness for coordinator integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rivven_txn::{
    AddOffsetsReply, AddOffsetsRequest, AddPartitionsReply, AddPartitionsRequest,
    CoordinatorConfig, EndTxnReply, EndTxnRequest, GroupId, InMemoryGroups, InMemoryPartitions,
    InMemoryTxLog, InitTxReply, InitTxRequest, ProducerIdentity, RetryConfig,
    SequentialIdAllocator, TmTransaction, TopicPartition, TryAbortReply, TryAbortRequest,
    TxCoordinator, TxSeq, TxStore,
};

pub type Coordinator = TxCoordinator<InMemoryPartitions, InMemoryGroups>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rivven_txn=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub fn tp(partition: u32) -> TopicPartition {
    TopicPartition::new("orders", partition)
}

pub fn group(id: &str) -> GroupId {
    GroupId::from(id)
}

/// Millisecond retries so rollforward tests finish quickly
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .rollforward(RetryConfig::fixed(Duration::from_millis(1)))
        .sync_rollforward_attempts(2)
        .participant_timeout(Duration::from_millis(500))
        .metadata_retries(3, Duration::from_millis(5))
        .wait_for_leader_timeout(Duration::from_millis(10))
        .forward_timeout(Duration::from_secs(2))
        .tx_timeout_delay(Duration::from_millis(10))
        .build()
        .expect("valid test config")
}

/// One coordinator partition over in-memory log and participants
pub struct Harness {
    pub log: Arc<InMemoryTxLog>,
    pub partitions: Arc<InMemoryPartitions>,
    pub groups: Arc<InMemoryGroups>,
    pub ids: Arc<SequentialIdAllocator>,
    pub coordinator: Arc<Coordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let log = Arc::new(InMemoryTxLog::new());
        let partitions = Arc::new(InMemoryPartitions::with_resources((0..4).map(tp)));
        let groups = Arc::new(InMemoryGroups::with_resources([group("g1"), group("g2")]));
        let ids = Arc::new(SequentialIdAllocator::default());
        let coordinator = Arc::new(TxCoordinator::new(
            0,
            config,
            Arc::new(TxStore::new(log.clone())),
            partitions.clone(),
            groups.clone(),
            ids.clone(),
        ));
        Self {
            log,
            partitions,
            groups,
            ids,
            coordinator,
        }
    }

    /// Fresh coordinator recovered from the same log, as after a crash
    pub async fn restarted(&self) -> Self {
        let store = TxStore::recover(self.log.clone())
            .await
            .expect("log replays");
        let coordinator = Arc::new(TxCoordinator::new(
            0,
            fast_config(),
            Arc::new(store),
            self.partitions.clone(),
            self.groups.clone(),
            self.ids.clone(),
        ));
        Self {
            log: self.log.clone(),
            partitions: self.partitions.clone(),
            groups: self.groups.clone(),
            ids: self.ids.clone(),
            coordinator,
        }
    }

    pub fn record(&self, id: &str) -> TmTransaction {
        self.coordinator.store().get(id).expect("record exists")
    }

    pub async fn init_reply(&self, id: &str) -> InitTxReply {
        self.coordinator
            .init_transaction(InitTxRequest {
                transactional_id: id.into(),
                transaction_timeout: None,
            })
            .await
    }

    pub async fn init(&self, id: &str) -> (ProducerIdentity, TxSeq) {
        let reply = self.init_reply(id).await;
        assert!(reply.error_code.is_ok(), "init failed: {reply:?}");
        (reply.pid.unwrap(), reply.tx_seq.unwrap())
    }

    pub async fn add(
        &self,
        id: &str,
        pid: ProducerIdentity,
        partitions: Vec<TopicPartition>,
    ) -> AddPartitionsReply {
        self.coordinator
            .add_partitions(AddPartitionsRequest {
                transactional_id: id.into(),
                pid,
                partitions,
            })
            .await
    }

    pub async fn add_group(&self, id: &str, pid: ProducerIdentity, group_id: &str) -> AddOffsetsReply {
        self.coordinator
            .add_offsets(AddOffsetsRequest {
                transactional_id: id.into(),
                pid,
                group_id: group(group_id),
            })
            .await
    }

    pub async fn end(
        &self,
        id: &str,
        pid: ProducerIdentity,
        tx_seq: TxSeq,
        committed: bool,
    ) -> EndTxnReply {
        self.coordinator
            .end_transaction(EndTxnRequest {
                transactional_id: id.into(),
                pid,
                tx_seq,
                committed,
            })
            .await
    }

    pub async fn try_abort(&self, pid: ProducerIdentity, tx_seq: TxSeq) -> TryAbortReply {
        self.coordinator
            .try_abort(TryAbortRequest {
                tm_partition: 0,
                pid,
                tx_seq,
            })
            .await
    }

    /// Wait for detached fan-out to finish
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.coordinator.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("background tasks did not finish");
    }
}
