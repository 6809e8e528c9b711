//! Outbound send dispatch and terminal outcome accounting.
//!
//! Every [`SendingContext`] resolves to exactly one [`Outcome`] and exactly
//! one monitor call; no outbound attempt disappears without a disposition.

pub mod monitor;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::dispatch::monitor::ConnectionMonitors;
use crate::faults::{ErrorResponse, Fault, FaultClass, FaultClassifier};
use crate::mapping::MappingPipeline;
use crate::signal::{Adaptable, ExternalMessage};
use crate::worker::transport::Connection;

pub use monitor::{MonitorCategory, MonitorCounters, MonitorSink, MonitorSnapshot};

/// Resolved destination of one outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress(pub String);

impl TargetAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One outbound send attempt. Created per send, consumed exactly once by
/// the dispatcher, then discarded.
pub struct SendingContext {
    /// The canonical signal being sent.
    pub signal: Adaptable,
    /// Resolved target, or `None` when address resolution failed upstream.
    pub target: Option<TargetAddress>,
    /// Monitors notified with the disposition.
    pub monitors: ConnectionMonitors,
    /// Optional acknowledgement channel resolved with the outcome.
    pub ack_reply: Option<oneshot::Sender<Outcome>>,
}

impl SendingContext {
    pub fn new(signal: Adaptable, target: Option<TargetAddress>) -> Self {
        Self {
            signal,
            target,
            monitors: ConnectionMonitors::disabled(),
            ack_reply: None,
        }
    }

    pub fn with_monitors(mut self, monitors: ConnectionMonitors) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn with_ack_reply(mut self, reply: oneshot::Sender<Outcome>) -> Self {
        self.ack_reply = Some(reply);
        self
    }

    /// Resolve this context as cancelled without attempting delivery.
    /// Used when a closing worker fails its pending sends.
    pub fn resolve_cancelled(self) {
        self.monitors.published.failure(
            &self.signal,
            "send cancelled by connection close",
            &[],
        );
        let outcome = Outcome::Failed {
            error: DispatchError::Cancelled,
        };
        if let Some(reply) = self.ack_reply {
            let _ = reply.send(outcome);
        }
    }
}

/// Terminal disposition of one outbound send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Sent { response: Option<ExternalMessage> },
    Dropped { reason: String },
    Failed { error: DispatchError },
}

impl Outcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Failures surfaced as `Outcome::Failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("transport send failed: {fault}")]
    Transport { fault: Fault, user_indicated: bool },
    #[error("send cancelled by connection close")]
    Cancelled,
    #[error("connection not established")]
    NotConnected,
}

/// Dispatches sending contexts through the outbound pipeline and records
/// their terminal outcome.
#[derive(Clone, Default)]
pub struct OutboundDispatcher {
    classifier: FaultClassifier,
}

impl OutboundDispatcher {
    pub fn new(classifier: FaultClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &FaultClassifier {
        &self.classifier
    }

    /// Dispatch one context. Exactly one outcome is produced and the ack
    /// reply, if any, is resolved with a copy of it.
    pub async fn dispatch(
        &self,
        context: SendingContext,
        pipeline: &MappingPipeline,
        connection: Option<&mut Box<dyn Connection>>,
    ) -> Outcome {
        let SendingContext {
            signal,
            target,
            monitors,
            ack_reply,
        } = context;

        let outcome = self
            .dispatch_inner(&signal, target, &monitors, pipeline, connection)
            .await;
        if let Some(reply) = ack_reply {
            let _ = reply.send(outcome.clone());
        }
        outcome
    }

    async fn dispatch_inner(
        &self,
        signal: &Adaptable,
        target: Option<TargetAddress>,
        monitors: &ConnectionMonitors,
        pipeline: &MappingPipeline,
        connection: Option<&mut Box<dyn Connection>>,
    ) -> Outcome {
        // Unresolved target: dropped, dropped-monitor only.
        let Some(target) = target else {
            let reason = "target address unresolved".to_string();
            monitors.dropped.failure(signal, &reason, &["<unresolved>"]);
            return Outcome::Dropped { reason };
        };

        let output = pipeline.map_outbound(signal);
        for failure in &output.failures {
            warn!(
                mapper = %failure.mapper,
                diagnostic = %failure.diagnostic,
                "outbound mapping failure isolated"
            );
        }
        if output.signals.is_empty() {
            let reason = if output.failures.is_empty() {
                "outbound pipeline produced no messages".to_string()
            } else {
                format!(
                    "outbound mapping failed: {}",
                    output.failures[0].diagnostic
                )
            };
            if output.failures.is_empty() {
                monitors.dropped.success(signal, &reason, &[target.as_str()]);
            } else {
                monitors.dropped.failure(signal, &reason, &[target.as_str()]);
            }
            return Outcome::Dropped { reason };
        }

        let Some(connection) = connection else {
            monitors
                .published
                .failure(signal, "connection not established", &[target.as_str()]);
            return Outcome::Failed {
                error: DispatchError::NotConnected,
            };
        };

        let mut last_receipt = None;
        for message in &output.signals {
            match connection.send(message).await {
                Ok(receipt) => last_receipt = Some(receipt),
                Err(err) => {
                    let fault = err.fault();
                    return match self.classifier.classify(&fault) {
                        FaultClass::UserIndicated => {
                            let response = ErrorResponse::from_fault(
                                &fault,
                                signal.header("entity-id"),
                            );
                            monitors.published.failure(
                                signal,
                                &response.to_bounded_json(),
                                &[target.as_str()],
                            );
                            Outcome::Failed {
                                error: DispatchError::Transport {
                                    fault,
                                    user_indicated: true,
                                },
                            }
                        }
                        FaultClass::System => {
                            monitors.published.failure(
                                signal,
                                &fault.to_string(),
                                &[target.as_str()],
                            );
                            Outcome::Failed {
                                error: DispatchError::Transport {
                                    fault,
                                    user_indicated: false,
                                },
                            }
                        }
                    };
                }
            }
        }

        let receipt = last_receipt.unwrap_or_default();
        if receipt.acknowledged {
            monitors
                .acknowledged
                .success(signal, "acknowledged by broker", &[target.as_str()]);
        } else {
            monitors
                .published
                .success(signal, "published", &[target.as_str()]);
        }
        debug!(target = target.as_str(), topic = %signal.topic, "outbound send complete");
        Outcome::Sent {
            response: receipt.response,
        }
    }
}
