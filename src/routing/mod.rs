//! Location-transparent routing of connection-scoped messages.
//!
//! A router delivers each envelope to the unique live worker for its
//! connection id, spawning workers on demand. Two implementations satisfy
//! the same single-writer contract: [`local::LocalEntityRouter`] for a
//! single process and [`ring::HashRingRouter`] for a cluster of nodes.

pub mod local;
pub mod ring;

use async_trait::async_trait;

use crate::core::config::{ConnectionDescriptor, ConnectionId, InvalidConnectionId};
use crate::signal::ExternalMessage;

pub use local::LocalEntityRouter;
pub use ring::{HashRing, HashRingRouter, PeerForwarder};

/// One inbound wire message addressed to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message: ExternalMessage,
}

impl InboundEnvelope {
    pub fn new(message: ExternalMessage) -> Self {
        Self { message }
    }
}

/// Routing failures, always surfaced synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("invalid connection id: {0}")]
    InvalidConnectionId(#[from] InvalidConnectionId),

    /// The configuration collaborator has no active definition for the id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The worker's bounded mailbox is full. Surfaced to the caller, not
    /// the worker.
    #[error("connection {0} mailbox full")]
    Backpressure(ConnectionId),

    /// The worker did not finish initializing within the creation wait.
    #[error("connection {0} did not finish initializing in time")]
    CreationTimeout(ConnectionId),

    /// Worker creation failed terminally (initialization retries
    /// exhausted, or the connection closed mid-spawn).
    #[error("connection {id} unavailable: {reason}")]
    ConnectionUnavailable { id: ConnectionId, reason: String },

    /// A cluster router determined the id belongs to another node.
    #[error("connection {id} is owned by node {owner}")]
    NotOwned { id: ConnectionId, owner: String },
}

/// Resolves a connection id to its unique live worker, spawning on demand.
#[async_trait]
pub trait EntityRouter: Send + Sync {
    /// Deliver one envelope to the worker owning `id`.
    async fn route(&self, id: &ConnectionId, envelope: InboundEnvelope)
        -> Result<(), RoutingError>;

    /// Gracefully stop the worker owning `id`.
    async fn close(&self, id: &ConnectionId) -> Result<(), RoutingError>;
}

/// Configuration collaborator: looks up connection definitions.
///
/// Loading and persistence of definitions live outside this crate.
pub trait DescriptorSource: Send + Sync + 'static {
    fn descriptor(&self, id: &ConnectionId) -> Option<ConnectionDescriptor>;
}
