//! Transaction coordinator error types
//!
//! Two layers of errors exist:
//!
//! - [`TxErrc`] is the coordinator-level code that crosses the RPC boundary.
//!   Every public coordinator operation answers with a reply carrying one.
//! - [`LogError`], [`StoreError`] and [`TransportError`] are internal and are
//!   always translated into a [`TxErrc`] before leaving the core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::InvalidTransition;

/// Coordinator error code returned to clients
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TxErrc {
    #[default]
    #[error("none")]
    None,

    // ==================== Fencing ====================
    #[error("producer fenced by a newer epoch or transaction sequence")]
    Fenced,

    // ==================== Rejection ====================
    #[error("request rejected in the current transaction state")]
    RequestRejected,

    #[error("concurrent modification of the transaction record")]
    Conflict,

    // ==================== Transient ====================
    #[error("coordinator partition leader not found")]
    LeaderNotFound,

    #[error("coordinator shard not found")]
    ShardNotFound,

    #[error("partition not found")]
    PartitionNotFound,

    #[error("coordinator partition does not exist")]
    PartitionNotExists,

    #[error("transaction state machine not found")]
    StmNotFound,

    #[error("request timed out")]
    Timeout,

    #[error("not the coordinator for this transaction")]
    NotCoordinator,

    // ==================== Unknown ====================
    #[error("unknown server error")]
    UnknownServerError,
}

impl TxErrc {
    /// True for [`TxErrc::None`]
    pub fn is_ok(&self) -> bool {
        matches!(self, TxErrc::None)
    }

    /// The request referenced a superseded producer identity
    pub fn is_fencing(&self) -> bool {
        matches!(self, TxErrc::Fenced)
    }

    /// Resolvable by retry or rediscovery
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TxErrc::LeaderNotFound
                | TxErrc::ShardNotFound
                | TxErrc::PartitionNotFound
                | TxErrc::StmNotFound
                | TxErrc::Timeout
                | TxErrc::NotCoordinator
        )
    }

    /// The operation is inconsistent with the current transaction status
    pub fn is_rejection(&self) -> bool {
        matches!(self, TxErrc::RequestRejected | TxErrc::Conflict)
    }

    /// Convert into a `Result`, treating [`TxErrc::None`] as success
    pub fn into_result(self) -> Result<(), TxErrc> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Errors from the replicated log that backs the transaction store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("not leader for term {term}")]
    NotLeader { term: i64 },

    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("log codec error: {0}")]
    Codec(String),
}

/// Errors from [`TxStore`](crate::store::TxStore) mutations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction record {0} changed concurrently")]
    Conflict(String),

    #[error("transaction record {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] LogError),

    #[error("store codec error: {0}")]
    Codec(String),
}

/// Errors from forwarding a request to another coordinator node
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} unreachable")]
    Unreachable(String),

    #[error("request to node {0} timed out")]
    Timeout(String),

    #[error("transport codec error: {0}")]
    Codec(String),
}

impl From<postcard::Error> for LogError {
    fn from(e: postcard::Error) -> Self {
        LogError::Codec(e.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<postcard::Error> for TransportError {
    fn from(e: postcard::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

impl From<LogError> for TxErrc {
    fn from(e: LogError) -> Self {
        match e {
            LogError::NotLeader { .. } | LogError::Unavailable(_) => TxErrc::NotCoordinator,
            LogError::Codec(_) => TxErrc::UnknownServerError,
        }
    }
}

impl From<StoreError> for TxErrc {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) => TxErrc::Conflict,
            StoreError::NotFound(_) | StoreError::Transition(_) => TxErrc::RequestRejected,
            StoreError::Unavailable(log) => log.into(),
            StoreError::Codec(_) => TxErrc::UnknownServerError,
        }
    }
}

// Forwarding failures stay distinguishable from transaction errors.
impl From<TransportError> for TxErrc {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(_) | TransportError::Timeout(_) => TxErrc::LeaderNotFound,
            TransportError::Codec(_) => TxErrc::UnknownServerError,
        }
    }
}

impl From<tokio::time::error::Elapsed> for TxErrc {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TxErrc::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TxEvent, TxStatus};

    #[test]
    fn test_classification() {
        assert!(TxErrc::None.is_ok());
        assert!(TxErrc::Fenced.is_fencing());
        assert!(TxErrc::LeaderNotFound.is_transient());
        assert!(TxErrc::StmNotFound.is_transient());
        assert!(!TxErrc::UnknownServerError.is_transient());
        assert!(TxErrc::RequestRejected.is_rejection());
        assert!(!TxErrc::Fenced.is_rejection());
    }

    #[test]
    fn test_into_result() {
        assert_eq!(TxErrc::None.into_result(), Ok(()));
        assert_eq!(TxErrc::Timeout.into_result(), Err(TxErrc::Timeout));
    }

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(
            TxErrc::from(StoreError::Conflict("t1".into())),
            TxErrc::Conflict
        );
        assert_eq!(
            TxErrc::from(StoreError::Unavailable(LogError::NotLeader { term: 3 })),
            TxErrc::NotCoordinator
        );
        let transition = TxStatus::Ready.on(TxEvent::Commit).unwrap_err();
        assert_eq!(
            TxErrc::from(StoreError::from(transition)),
            TxErrc::RequestRejected
        );
    }

    #[test]
    fn test_transport_errors_are_routing_errors() {
        let ec = TxErrc::from(TransportError::Unreachable("node-2".into()));
        assert_eq!(ec, TxErrc::LeaderNotFound);
        assert!(ec.is_transient());
    }
}
