//! Routing of coordinator requests to the leader of their coordinator partition
//!
//! A transactional id maps to a coordinator partition through
//! [`coordinator_partition_for`]. The router looks up the current leader of
//! that partition, serves the request from the local [`ShardTable`] when this
//! node leads, and forwards it through a [`CoordinatorTransport`] otherwise.
//! Lookups are retried while the leader or shard is unknown.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::coordinator::TxCoordinator;
use crate::error::{TransportError, TxErrc};
use crate::participant::ResourceManager;
use crate::protocol::{
    AddOffsetsReply, AddOffsetsRequest, AddPartitionsReply, AddPartitionsRequest, EndTxnReply,
    EndTxnRequest, InitTxReply, InitTxRequest, TryAbortReply, TryAbortRequest, TxRequest,
    TxResponse,
};
use crate::types::{GroupId, NodeId, TopicPartition};

// ============================================================================
// Partition mapping
// ============================================================================

/// Kafka-compatible murmur2 hash
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (shift, byte) in tail.iter().enumerate() {
            h ^= u32::from(*byte) << (8 * shift);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Coordinator partition owning `transactional_id` out of `partitions`
pub fn coordinator_partition_for(transactional_id: &str, partitions: u32) -> u32 {
    (murmur2(transactional_id.as_bytes()) & 0x7fff_ffff) % partitions.max(1)
}

// ============================================================================
// Leader discovery
// ============================================================================

/// Source of coordinator partition leadership
#[async_trait]
pub trait LeaderResolver: Send + Sync {
    /// Current leader of `partition`, waiting up to `timeout` for one to be
    /// elected
    async fn wait_for_leader(&self, partition: u32, timeout: Duration) -> Option<NodeId>;
}

/// Leadership table maintained by the embedding node
#[derive(Debug, Default)]
pub struct StaticLeaders {
    leaders: DashMap<u32, NodeId>,
    changed: Notify,
}

impl StaticLeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leader(&self, partition: u32, node: impl Into<NodeId>) {
        self.leaders.insert(partition, node.into());
        self.changed.notify_waiters();
    }

    pub fn clear_leader(&self, partition: u32) {
        self.leaders.remove(&partition);
    }

    pub fn leader_of(&self, partition: u32) -> Option<NodeId> {
        self.leaders.get(&partition).map(|node| node.value().clone())
    }
}

#[async_trait]
impl LeaderResolver for StaticLeaders {
    async fn wait_for_leader(&self, partition: u32, timeout: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            if let Some(node) = self.leader_of(partition) {
                return Some(node);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.leader_of(partition);
            }
        }
    }
}

// ============================================================================
// Local shards
// ============================================================================

/// Coordinators served by this node, keyed by coordinator partition
pub struct ShardTable<P, G> {
    shards: DashMap<u32, Arc<TxCoordinator<P, G>>>,
}

impl<P, G> Default for ShardTable<P, G> {
    fn default() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }
}

impl<P, G> ShardTable<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, coordinator: Arc<TxCoordinator<P, G>>) {
        self.shards.insert(coordinator.partition(), coordinator);
    }

    pub fn remove(&self, partition: u32) -> Option<Arc<TxCoordinator<P, G>>> {
        self.shards.remove(&partition).map(|(_, coordinator)| coordinator)
    }

    pub fn shard_for(&self, partition: u32) -> Option<Arc<TxCoordinator<P, G>>> {
        self.shards
            .get(&partition)
            .map(|coordinator| Arc::clone(coordinator.value()))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Stop every local coordinator
    pub async fn stop_all(&self) {
        let shards: Vec<_> = self
            .shards
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for shard in shards {
            shard.stop().await;
        }
    }
}

// ============================================================================
// Forwarding
// ============================================================================

/// Delivery of a coordinator request to another node
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn send(
        &self,
        node: &NodeId,
        request: TxRequest,
        timeout: Duration,
    ) -> Result<TxResponse, TransportError>;
}

/// In-process transport between routers, going through the wire codec
pub struct LoopbackTransport<P, G> {
    nodes: DashMap<NodeId, Weak<CoordinatorRouter<P, G>>>,
    down: Mutex<HashSet<NodeId>>,
}

impl<P, G> Default for LoopbackTransport<P, G> {
    fn default() -> Self {
        Self {
            nodes: DashMap::new(),
            down: Mutex::new(HashSet::new()),
        }
    }
}

impl<P, G> LoopbackTransport<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, router: &Arc<CoordinatorRouter<P, G>>) {
        self.nodes
            .insert(router.node().clone(), Arc::downgrade(router));
    }

    /// Make `node` unreachable until [`LoopbackTransport::reconnect`]
    pub fn disconnect(&self, node: &str) {
        self.down.lock().insert(node.to_string());
    }

    pub fn reconnect(&self, node: &str) {
        self.down.lock().remove(node);
    }
}

#[async_trait]
impl<P, G> CoordinatorTransport for LoopbackTransport<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    async fn send(
        &self,
        node: &NodeId,
        request: TxRequest,
        timeout: Duration,
    ) -> Result<TxResponse, TransportError> {
        if self.down.lock().contains(node) {
            return Err(TransportError::Unreachable(node.clone()));
        }
        let router = self
            .nodes
            .get(node)
            .and_then(|router| router.value().upgrade())
            .ok_or_else(|| TransportError::Unreachable(node.clone()))?;

        let request = TxRequest::decode(&request.encode()?)?;
        let response = tokio::time::timeout(timeout, router.handle_forwarded(request))
            .await
            .map_err(|_| TransportError::Timeout(node.clone()))?;
        TxResponse::decode(&response.encode()?)
    }
}

// ============================================================================
// Router
// ============================================================================

enum Target<P, G> {
    Local(Arc<TxCoordinator<P, G>>),
    Remote(NodeId),
}

/// Entry point for coordinator requests on one node
pub struct CoordinatorRouter<P, G> {
    node: NodeId,
    config: CoordinatorConfig,
    leaders: Arc<dyn LeaderResolver>,
    shards: Arc<ShardTable<P, G>>,
    transport: Arc<dyn CoordinatorTransport>,
    shutdown: CancellationToken,
}

impl<P, G> CoordinatorRouter<P, G>
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    pub fn new(
        node: impl Into<NodeId>,
        config: CoordinatorConfig,
        leaders: Arc<dyn LeaderResolver>,
        shards: Arc<ShardTable<P, G>>,
        transport: Arc<dyn CoordinatorTransport>,
    ) -> Self {
        Self {
            node: node.into(),
            config,
            leaders,
            shards,
            transport,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn shards(&self) -> &Arc<ShardTable<P, G>> {
        &self.shards
    }

    pub async fn init_transaction(&self, request: InitTxRequest) -> InitTxReply {
        match self.route(TxRequest::InitTx(request)).await {
            TxResponse::InitTx(reply) => reply,
            _ => InitTxReply::error(TxErrc::UnknownServerError),
        }
    }

    pub async fn add_partitions(&self, request: AddPartitionsRequest) -> AddPartitionsReply {
        let partitions = request.partitions.clone();
        match self.route(TxRequest::AddPartitions(request)).await {
            TxResponse::AddPartitions(reply) => reply,
            _ => AddPartitionsReply::error(&partitions, TxErrc::UnknownServerError),
        }
    }

    pub async fn add_offsets(&self, request: AddOffsetsRequest) -> AddOffsetsReply {
        match self.route(TxRequest::AddOffsets(request)).await {
            TxResponse::AddOffsets(reply) => reply,
            _ => AddOffsetsReply {
                error_code: TxErrc::UnknownServerError,
            },
        }
    }

    pub async fn end_transaction(&self, request: EndTxnRequest) -> EndTxnReply {
        match self.route(TxRequest::EndTxn(request)).await {
            TxResponse::EndTxn(reply) => reply,
            _ => EndTxnReply::error(TxErrc::UnknownServerError),
        }
    }

    pub async fn try_abort(&self, request: TryAbortRequest) -> TryAbortReply {
        match self.route(TxRequest::TryAbort(request)).await {
            TxResponse::TryAbort(reply) => reply,
            _ => TryAbortReply::error(TxErrc::UnknownServerError),
        }
    }

    /// Serve a request forwarded by another node; never forwards again
    pub async fn handle_forwarded(&self, request: TxRequest) -> TxResponse {
        let partition = match self.partition_of(&request) {
            Ok(partition) => partition,
            Err(ec) => return request.error_response(ec),
        };
        let leader = self.leaders.wait_for_leader(partition, Duration::ZERO).await;
        match (leader, self.shards.shard_for(partition)) {
            (Some(leader), Some(shard)) if leader == self.node => {
                dispatch(&shard, request).await
            }
            _ => {
                debug!(node = %self.node, partition, request = request.name(), "Forwarded request for a partition this node does not lead");
                request.error_response(TxErrc::NotCoordinator)
            }
        }
    }

    /// Abort pending lookups
    pub fn stop(&self) {
        info!(node = %self.node, "Stopping coordinator router");
        self.shutdown.cancel();
    }

    async fn route(&self, request: TxRequest) -> TxResponse {
        let partition = match self.partition_of(&request) {
            Ok(partition) => partition,
            Err(ec) => return request.error_response(ec),
        };

        let retries = self.config.metadata_dissemination_retries;
        let mut attempt = 0;
        let error = loop {
            match self.resolve(partition).await {
                Ok(Target::Local(shard)) => return dispatch(&shard, request).await,
                Ok(Target::Remote(node)) => return self.forward(&node, request).await,
                Err(ec) if attempt >= retries => break ec,
                Err(ec) => {
                    debug!(partition, attempt, error = %ec, "Coordinator lookup failed, retrying");
                }
            }
            attempt += 1;
            if !self.sleep(self.config.metadata_dissemination_retry_delay).await {
                break TxErrc::LeaderNotFound;
            }
        };

        warn!(
            node = %self.node,
            partition,
            request = request.name(),
            error = %error,
            "Giving up on coordinator lookup"
        );
        request.error_response(error)
    }

    fn partition_of(&self, request: &TxRequest) -> Result<u32, TxErrc> {
        let partitions = self.config.coordinator_partitions;
        let partition = match (request, request.transactional_id()) {
            (TxRequest::TryAbort(r), _) => r.tm_partition,
            (_, Some(id)) => coordinator_partition_for(id, partitions),
            (_, None) => return Err(TxErrc::RequestRejected),
        };
        if partition >= partitions {
            return Err(TxErrc::PartitionNotExists);
        }
        Ok(partition)
    }

    async fn resolve(&self, partition: u32) -> Result<Target<P, G>, TxErrc> {
        let leader = self
            .leaders
            .wait_for_leader(partition, self.config.wait_for_leader_timeout)
            .await
            .ok_or(TxErrc::LeaderNotFound)?;
        if leader != self.node {
            return Ok(Target::Remote(leader));
        }
        self.shards
            .shard_for(partition)
            .map(Target::Local)
            .ok_or(TxErrc::ShardNotFound)
    }

    async fn forward(&self, node: &NodeId, request: TxRequest) -> TxResponse {
        debug!(from = %self.node, to = %node, request = request.name(), "Forwarding coordinator request");
        match self
            .transport
            .send(node, request.clone(), self.config.forward_timeout)
            .await
        {
            Ok(response) if request.matches(&response) => response,
            Ok(response) => {
                warn!(to = %node, request = request.name(), ?response, "Mismatched forwarded response");
                request.error_response(TxErrc::UnknownServerError)
            }
            Err(e) => {
                warn!(to = %node, request = request.name(), error = %e, "Forwarding failed");
                request.error_response(e.into())
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn dispatch<P, G>(shard: &Arc<TxCoordinator<P, G>>, request: TxRequest) -> TxResponse
where
    P: ResourceManager<TopicPartition>,
    G: ResourceManager<GroupId>,
{
    match request {
        TxRequest::InitTx(r) => TxResponse::InitTx(shard.init_transaction(r).await),
        TxRequest::AddPartitions(r) => TxResponse::AddPartitions(shard.add_partitions(r).await),
        TxRequest::AddOffsets(r) => TxResponse::AddOffsets(shard.add_offsets(r).await),
        TxRequest::EndTxn(r) => TxResponse::EndTxn(shard.end_transaction(r).await),
        TxRequest::TryAbort(r) => TxResponse::TryAbort(shard.try_abort(r).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_murmur2_deterministic() {
        assert_eq!(murmur2(b"tx-1"), murmur2(b"tx-1"));
        assert_ne!(murmur2(b"tx-1"), murmur2(b"tx-2"));
        // every tail length
        let hashes: HashSet<u32> = (0..8).map(|n| murmur2(&b"abcdefgh"[..n])).collect();
        assert_eq!(hashes.len(), 8);
    }

    #[test]
    fn test_partition_mapping_in_range() {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for i in 0..1000 {
            let partition = coordinator_partition_for(&format!("producer-{i}"), 8);
            assert!(partition < 8);
            *counts.entry(partition).or_default() += 1;
        }
        assert_eq!(counts.len(), 8);
        assert_eq!(coordinator_partition_for("anything", 1), 0);
        assert_eq!(coordinator_partition_for("anything", 0), 0);
    }

    #[tokio::test]
    async fn test_wait_for_leader() {
        let leaders = Arc::new(StaticLeaders::new());
        assert_eq!(
            leaders.wait_for_leader(0, Duration::from_millis(5)).await,
            None
        );

        let waiter = {
            let leaders = Arc::clone(&leaders);
            tokio::spawn(async move { leaders.wait_for_leader(0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leaders.set_leader(0, "n1");
        assert_eq!(waiter.await.unwrap(), Some("n1".to_string()));

        leaders.clear_leader(0);
        assert_eq!(leaders.leader_of(0), None);
    }
}
