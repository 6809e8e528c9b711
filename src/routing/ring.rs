//! Cluster-aware routing over a consistent-hash ring.
//!
//! Connection ids are hashed onto the member ring with a jump-consistent
//! hash: growing the ring only moves keys onto the new member, so a
//! rolling scale-out does not reshuffle every connection. Ids owned by
//! this node delegate to the wrapped local router; everything else is
//! handed to the peer forwarder collaborator.

use async_trait::async_trait;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

use crate::core::config::ConnectionId;
use crate::routing::{EntityRouter, InboundEnvelope, RoutingError};

/// Delivers envelopes to the router of another cluster node.
///
/// Cross-node transport is outside this crate; a forwarder typically wraps
/// an RPC client.
#[async_trait]
pub trait PeerForwarder: Send + Sync {
    async fn forward(
        &self,
        node: &str,
        id: &ConnectionId,
        envelope: InboundEnvelope,
    ) -> Result<(), RoutingError>;

    async fn forward_close(&self, node: &str, id: &ConnectionId) -> Result<(), RoutingError>;
}

/// Consistent-hash ring over the sorted member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    members: Vec<String>,
}

impl HashRing {
    /// Build a ring; members are deduplicated and sorted so every node
    /// derives the identical ring from the same membership set.
    pub fn new(mut members: Vec<String>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Owning member for a connection id, or `None` on an empty ring.
    pub fn owner(&self, id: &ConnectionId) -> Option<&str> {
        if self.members.is_empty() {
            return None;
        }
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(id.as_str().as_bytes());
        let bucket = jump_consistent_hash(hasher.finish(), self.members.len() as u32);
        self.members.get(bucket as usize).map(String::as_str)
    }
}

/// Jump consistent hash: maps a key uniformly onto `num_buckets` with
/// minimal movement when the bucket count changes.
fn jump_consistent_hash(mut key: u64, num_buckets: u32) -> u32 {
    if num_buckets == 0 {
        return 0;
    }
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (1i64 << 31) as f64
            / ((key >> 33).wrapping_add(1) as f64)) as i64;
    }
    b as u32
}

/// Cluster router: local delivery for owned ids, forwarding otherwise.
///
/// Satisfies the same single-writer contract as the local router because
/// every node derives the same owner for a given id and only the owner
/// spawns.
pub struct HashRingRouter<R: EntityRouter> {
    local_node: String,
    ring: HashRing,
    inner: R,
    forwarder: Arc<dyn PeerForwarder>,
}

impl<R: EntityRouter> HashRingRouter<R> {
    pub fn new(
        local_node: impl Into<String>,
        ring: HashRing,
        inner: R,
        forwarder: Arc<dyn PeerForwarder>,
    ) -> Self {
        Self {
            local_node: local_node.into(),
            ring,
            inner,
            forwarder,
        }
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Whether this node owns the id.
    pub fn owns(&self, id: &ConnectionId) -> bool {
        self.ring.owner(id) == Some(self.local_node.as_str())
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn owner_of(&self, id: &ConnectionId) -> Result<String, RoutingError> {
        self.ring
            .owner(id)
            .map(str::to_string)
            .ok_or_else(|| RoutingError::ConnectionUnavailable {
                id: id.clone(),
                reason: "cluster ring has no members".into(),
            })
    }
}

#[async_trait]
impl<R: EntityRouter> EntityRouter for HashRingRouter<R> {
    async fn route(
        &self,
        id: &ConnectionId,
        envelope: InboundEnvelope,
    ) -> Result<(), RoutingError> {
        let owner = self.owner_of(id)?;
        if owner == self.local_node {
            self.inner.route(id, envelope).await
        } else {
            self.forwarder.forward(&owner, id, envelope).await
        }
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), RoutingError> {
        let owner = self.owner_of(id)?;
        if owner == self.local_node {
            self.inner.close(id).await
        } else {
            self.forwarder.forward_close(&owner, id).await
        }
    }
}
