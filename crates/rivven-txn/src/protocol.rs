//! Coordinator requests and replies
//!
//! Every reply carries a [`TxErrc`]. [`TxRequest`]/[`TxResponse`] wrap them
//! for forwarding between coordinator nodes, encoded with postcard.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TransportError, TxErrc};
use crate::types::{GroupId, ProducerIdentity, TopicPartition, TransactionalId, TxSeq};

// ============================================================================
// init_transaction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTxRequest {
    pub transactional_id: TransactionalId,
    /// Falls back to the configured default when absent
    pub transaction_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitTxReply {
    pub pid: Option<ProducerIdentity>,
    pub tx_seq: Option<TxSeq>,
    pub error_code: TxErrc,
}

impl InitTxReply {
    pub fn ok(pid: ProducerIdentity, tx_seq: TxSeq) -> Self {
        Self {
            pid: Some(pid),
            tx_seq: Some(tx_seq),
            error_code: TxErrc::None,
        }
    }

    pub fn error(error_code: TxErrc) -> Self {
        Self {
            pid: None,
            tx_seq: None,
            error_code,
        }
    }
}

// ============================================================================
// add_partitions / add_offsets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPartitionsRequest {
    pub transactional_id: TransactionalId,
    pub pid: ProducerIdentity,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub partition: TopicPartition,
    pub error_code: TxErrc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddPartitionsReply {
    pub results: Vec<PartitionResult>,
}

impl AddPartitionsReply {
    /// Same error for every requested partition
    pub fn error(partitions: &[TopicPartition], error_code: TxErrc) -> Self {
        Self {
            results: partitions
                .iter()
                .map(|tp| PartitionResult {
                    partition: tp.clone(),
                    error_code,
                })
                .collect(),
        }
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.error_code.is_ok())
    }

    pub fn error_for(&self, tp: &TopicPartition) -> Option<TxErrc> {
        self.results
            .iter()
            .find(|r| r.partition == *tp)
            .map(|r| r.error_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOffsetsRequest {
    pub transactional_id: TransactionalId,
    pub pid: ProducerIdentity,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOffsetsReply {
    pub error_code: TxErrc,
}

// ============================================================================
// end_transaction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTxnRequest {
    pub transactional_id: TransactionalId,
    pub pid: ProducerIdentity,
    pub tx_seq: TxSeq,
    pub committed: bool,
}

/// Decision for an end_transaction request
///
/// On success `pid`/`tx_seq` identify the producer session to use for the
/// next transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTxnReply {
    pub error_code: TxErrc,
    pub pid: Option<ProducerIdentity>,
    pub tx_seq: Option<TxSeq>,
}

impl EndTxnReply {
    pub fn ok(pid: ProducerIdentity, tx_seq: TxSeq) -> Self {
        Self {
            error_code: TxErrc::None,
            pid: Some(pid),
            tx_seq: Some(tx_seq),
        }
    }

    pub fn error(error_code: TxErrc) -> Self {
        Self {
            error_code,
            pid: None,
            tx_seq: None,
        }
    }
}

// ============================================================================
// try_abort
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryAbortRequest {
    /// Coordinator partition that sent the prepare
    pub tm_partition: u32,
    pub pid: ProducerIdentity,
    pub tx_seq: TxSeq,
}

/// Neither `committed` nor `aborted` with no error means "undecided, retry"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryAbortReply {
    pub committed: bool,
    pub aborted: bool,
    pub error_code: TxErrc,
}

impl TryAbortReply {
    pub fn committed() -> Self {
        Self {
            committed: true,
            aborted: false,
            error_code: TxErrc::None,
        }
    }

    pub fn aborted() -> Self {
        Self {
            committed: false,
            aborted: true,
            error_code: TxErrc::None,
        }
    }

    pub fn pending() -> Self {
        Self::error(TxErrc::None)
    }

    pub fn error(error_code: TxErrc) -> Self {
        Self {
            committed: false,
            aborted: false,
            error_code,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.error_code.is_ok() && !self.committed && !self.aborted
    }
}

// ============================================================================
// Envelope for forwarding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRequest {
    InitTx(InitTxRequest),
    AddPartitions(AddPartitionsRequest),
    AddOffsets(AddOffsetsRequest),
    EndTxn(EndTxnRequest),
    TryAbort(TryAbortRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResponse {
    InitTx(InitTxReply),
    AddPartitions(AddPartitionsReply),
    AddOffsets(AddOffsetsReply),
    EndTxn(EndTxnReply),
    TryAbort(TryAbortReply),
}

impl TxRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TxRequest::InitTx(_) => "init_tx",
            TxRequest::AddPartitions(_) => "add_partitions",
            TxRequest::AddOffsets(_) => "add_offsets",
            TxRequest::EndTxn(_) => "end_txn",
            TxRequest::TryAbort(_) => "try_abort",
        }
    }

    /// Transactional id used to pick the coordinator partition; `None` for
    /// requests that name the partition themselves
    pub fn transactional_id(&self) -> Option<&str> {
        match self {
            TxRequest::InitTx(r) => Some(&r.transactional_id),
            TxRequest::AddPartitions(r) => Some(&r.transactional_id),
            TxRequest::AddOffsets(r) => Some(&r.transactional_id),
            TxRequest::EndTxn(r) => Some(&r.transactional_id),
            TxRequest::TryAbort(_) => None,
        }
    }

    /// Response of the matching kind carrying `error_code`
    pub fn error_response(&self, error_code: TxErrc) -> TxResponse {
        match self {
            TxRequest::InitTx(_) => TxResponse::InitTx(InitTxReply::error(error_code)),
            TxRequest::AddPartitions(r) => {
                TxResponse::AddPartitions(AddPartitionsReply::error(&r.partitions, error_code))
            }
            TxRequest::AddOffsets(_) => TxResponse::AddOffsets(AddOffsetsReply { error_code }),
            TxRequest::EndTxn(_) => TxResponse::EndTxn(EndTxnReply::error(error_code)),
            TxRequest::TryAbort(_) => TxResponse::TryAbort(TryAbortReply::error(error_code)),
        }
    }

    /// `response` is of the kind this request expects
    pub fn matches(&self, response: &TxResponse) -> bool {
        matches!(
            (self, response),
            (TxRequest::InitTx(_), TxResponse::InitTx(_))
                | (TxRequest::AddPartitions(_), TxResponse::AddPartitions(_))
                | (TxRequest::AddOffsets(_), TxResponse::AddOffsets(_))
                | (TxRequest::EndTxn(_), TxResponse::EndTxn(_))
                | (TxRequest::TryAbort(_), TxResponse::TryAbort(_))
        )
    }

    pub fn encode(&self) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

impl TxResponse {
    pub fn error_code(&self) -> TxErrc {
        match self {
            TxResponse::InitTx(r) => r.error_code,
            TxResponse::AddPartitions(r) => r
                .results
                .iter()
                .map(|p| p.error_code)
                .find(|ec| !ec.is_ok())
                .unwrap_or(TxErrc::None),
            TxResponse::AddOffsets(r) => r.error_code,
            TxResponse::EndTxn(r) => r.error_code,
            TxResponse::TryAbort(r) => r.error_code,
        }
    }

    pub fn encode(&self) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
