//! Transport collaborator seam.
//!
//! Concrete wire-protocol clients (AMQP/MQTT/Kafka socket handling) live
//! outside this crate and plug in through [`Transport`]. The worker owns at
//! most one live [`Connection`] at a time and drives it strictly
//! sequentially.

use async_trait::async_trait;
use std::fmt;

use crate::core::config::ConnectionDescriptor;
use crate::faults::Fault;
use crate::signal::ExternalMessage;

/// Factory for live broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection for the descriptor. Called for initial
    /// connects, reconnects, and connectivity tests alike.
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One established broker connection.
///
/// `recv` must be cancel-safe: the worker polls it inside `select!` and
/// drops the future whenever a command wins the race.
#[async_trait]
pub trait Connection: Send {
    /// Send one wire message, returning the broker's receipt.
    async fn send(&mut self, message: &ExternalMessage) -> Result<SendReceipt, TransportError>;

    /// Next inbound message; `None` once the transport stream ends.
    async fn recv(&mut self) -> Option<Result<ExternalMessage, TransportError>>;

    /// Release the underlying resources. Must be idempotent.
    async fn close(&mut self);
}

/// Broker acknowledgement for one sent message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    /// Whether the broker confirmed the delivery (vs. fire-and-forget).
    pub acknowledged: bool,
    /// Optional broker response payload, e.g. a reply-to message.
    pub response: Option<ExternalMessage>,
}

impl SendReceipt {
    pub fn published() -> Self {
        Self {
            acknowledged: false,
            response: None,
        }
    }

    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            response: None,
        }
    }

    pub fn with_response(mut self, response: ExternalMessage) -> Self {
        self.response = Some(response);
        self
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The endpoint cannot be reached at all.
    Unreachable,
    /// An established connection was lost.
    ConnectionLost,
    /// The broker rejected the operation.
    Rejected,
    /// The operation exceeded its deadline.
    Timeout,
    /// The peer violated the wire protocol.
    Protocol,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::ConnectionLost => "connection-lost",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
        }
    }

    /// Whether this kind indicates the transport itself is gone, requiring
    /// a reconnect rather than a per-message retry.
    pub fn is_connection_loss(self) -> bool {
        matches!(self, Self::Unreachable | Self::ConnectionLost | Self::Timeout)
    }
}

/// Classify a fault kind string produced by [`TransportError::fault`].
pub fn is_connection_loss_kind(kind: &str) -> bool {
    matches!(kind, "unreachable" | "connection-lost" | "timeout")
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn bare(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Reduce to the classifiable fault form.
    pub fn fault(&self) -> Fault {
        Fault::new(self.kind.as_str(), self.message.clone())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind.as_str(), message),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl std::error::Error for TransportError {}
