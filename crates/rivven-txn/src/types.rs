//! Identifiers shared across the coordinator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-supplied key of a transaction session
pub type TransactionalId = String;

/// Cluster node identifier
pub type NodeId = String;

/// Index of a local coordinator shard
pub type ShardId = u32;

/// Producer identity: `{id, epoch}` issued per producer session
///
/// The epoch grows monotonically for a given id and fences older sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerIdentity {
    pub id: i64,
    pub epoch: i16,
}

impl ProducerIdentity {
    pub const fn new(id: i64, epoch: i16) -> Self {
        Self { id, epoch }
    }

    /// No further epoch can be issued for this id
    pub fn is_epoch_exhausted(&self) -> bool {
        self.epoch == i16::MAX
    }

    /// Identity with the next epoch, or `None` when the epoch is exhausted
    pub fn bump_epoch(&self) -> Option<Self> {
        self.epoch
            .checked_add(1)
            .map(|epoch| Self { id: self.id, epoch })
    }

    /// `other` is an earlier session of the same producer id
    pub fn supersedes(&self, other: &ProducerIdentity) -> bool {
        self.id == other.id && self.epoch > other.epoch
    }
}

impl fmt::Display for ProducerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.epoch)
    }
}

/// Sequence number of one transaction attempt under a producer identity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxSeq(pub i64);

impl TxSeq {
    pub fn next(self) -> Self {
        TxSeq(self.0 + 1)
    }
}

impl fmt::Display for TxSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Leadership term of the coordinator log
///
/// Also used as the fencing token a participant hands out on `begin_tx`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Term(pub i64);

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition of a user topic taking part in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A consumer group whose offsets are committed inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition registered in a transaction together with its fencing token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPartition {
    pub tp: TopicPartition,
    pub etag: Term,
}

/// Consumer group registered in a transaction together with its fencing token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxGroup {
    pub group_id: GroupId,
    pub etag: Term,
}
