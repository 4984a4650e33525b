//! # Rivven Transactions
//!
//! Transaction coordinator for exactly-once produce across partitions and
//! consumer group offsets:
//! - **Durable state machine**: one record per transactional id, replicated
//!   through a coordinator log with term-based etags
//! - **Two-phase commit**: prepare on every participant, decide, then commit
//!   or abort with unbounded retries once decided
//! - **Producer fencing**: epoch bumps on every init and completed transaction
//! - **Rollforward**: decided but unfinished transactions are completed before
//!   any new operation on the same id
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     CoordinatorRouter                         │
//! │        partition = murmur2(tx_id) % coordinator_partitions    │
//! ├──────────────────────────────┬────────────────────────────────┤
//! │  local leader: ShardTable    │  remote leader: Transport      │
//! ├──────────────────────────────┴────────────────────────────────┤
//! │                      TxCoordinator                            │
//! │  TxLocks ─► TxStore (TxLog) ─► Participants (2PC fan-out)     │
//! │                      ShutdownGate (detached fan-out)          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use rivven_txn::*;
//!
//! let log = Arc::new(InMemoryTxLog::new());
//! let coordinator = Arc::new(TxCoordinator::new(
//!     0,
//!     CoordinatorConfig::default(),
//!     Arc::new(TxStore::recover(log).await?),
//!     partitions,
//!     groups,
//!     Arc::new(SequentialIdAllocator::default()),
//! ));
//!
//! let init = coordinator
//!     .init_transaction(InitTxRequest { transactional_id: "tx-1".into(), transaction_timeout: None })
//!     .await;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod id_allocator;
pub mod lock;
pub mod log;
pub mod observability;
pub mod participant;
pub mod protocol;
pub mod router;
pub mod state;
pub mod store;
pub mod two_phase;
pub mod types;

// Re-export main types
pub use config::{CoordinatorConfig, CoordinatorConfigBuilder, RetryConfig, TxConfigError};
pub use coordinator::TxCoordinator;
pub use error::{LogError, StoreError, TransportError, TxErrc};
pub use gate::ShutdownGate;
pub use id_allocator::{ProducerIdAllocator, SequentialIdAllocator};
pub use lock::TxLocks;
pub use log::{InMemoryTxLog, LogEntry, LogReplay, TxLog, TxSnapshot};
pub use observability::{init_metrics, TxMetrics, TxStats, TxStatsSnapshot};
pub use participant::{
    InMemoryGroups, InMemoryPartitions, InMemoryResourceManager, ParticipantOp,
    ParticipantTxState, PrepareVote, ResourceKind, ResourceManager,
};
pub use protocol::{
    AddOffsetsReply, AddOffsetsRequest, AddPartitionsReply, AddPartitionsRequest, EndTxnReply,
    EndTxnRequest, InitTxReply, InitTxRequest, PartitionResult, TryAbortReply, TryAbortRequest,
    TxRequest, TxResponse,
};
pub use router::{
    coordinator_partition_for, CoordinatorRouter, CoordinatorTransport, LeaderResolver,
    LoopbackTransport, ShardTable, StaticLeaders,
};
pub use state::{TmTransaction, TxEvent, TxOutcome, TxStatus};
pub use store::TxStore;
pub use two_phase::{Decision, Participants, Phase, PrepareOutcome};
pub use types::{
    GroupId, NodeId, ProducerIdentity, ShardId, Term, TopicPartition, TransactionalId, TxGroup,
    TxPartition, TxSeq,
};
