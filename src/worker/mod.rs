//! The per-connection worker actor.
//!
//! One dedicated task per connection id reads a private bounded mailbox
//! and the transport's inbound stream. Message handling is strictly
//! sequential: every state transition and every pipeline invocation for
//! one connection happens-before the next, which is what makes the state
//! machine safe without locks.

pub mod supervisor;
pub mod transport;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::config::{ConnectionDescriptor, ConnectionId, RestartPolicy, WorkerTimeouts};
use crate::core::time::Clock;
use crate::dispatch::{DispatchError, Outcome, OutboundDispatcher, SendingContext};
use crate::faults::ErrorResponse;
use crate::mapping::{MapperRegistry, MappingError, MappingPipeline};
use crate::ops::{ConnectionEvents, ConnectionStatus};
use crate::routing::InboundEnvelope;
use crate::signal::Adaptable;
use crate::worker::transport::{is_connection_loss_kind, Connection, Transport};

pub use supervisor::{RetryState, SpawnDiagnostics, SpawnError, WorkerSupervisor};

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Downstream consumer of canonical signals produced by inbound mapping.
#[async_trait]
pub trait SignalProcessor: Send + Sync + 'static {
    async fn accept(&self, signal: Adaptable);
}

// ---------------------------------------------------------------------------
// Creation arguments
// ---------------------------------------------------------------------------

/// Opaque address of a collaborator actor, e.g. `tether://node-1/processor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef(pub String);

impl ActorRef {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

/// Everything needed to create a worker, as one serializable value.
///
/// Handed across process boundaries when worker placement moves; must
/// round-trip through serialization to an equal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationArgs {
    pub descriptor: ConnectionDescriptor,
    /// Downstream signal processor the worker proxies inbound signals to.
    pub processor_ref: ActorRef,
    /// Where the worker reports its own lifecycle notifications.
    pub notify_ref: ActorRef,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Configuration overwrites applied on top of the descriptor.
    #[serde(default)]
    pub overwrites: BTreeMap<String, serde_json::Value>,
}

impl CreationArgs {
    pub fn new(descriptor: ConnectionDescriptor, processor_ref: ActorRef, notify_ref: ActorRef) -> Self {
        Self {
            descriptor,
            processor_ref,
            notify_ref,
            request_headers: HashMap::new(),
            overwrites: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and handle
// ---------------------------------------------------------------------------

/// Messages accepted by a worker's private mailbox.
pub enum WorkerCommand {
    /// An inbound wire message routed to this connection.
    Inbound(InboundEnvelope),
    /// An outbound send request.
    Dispatch(SendingContext),
    /// Replace the configuration; forces a full close/reconnect cycle.
    UpdateDescriptor(ConnectionDescriptor),
    /// Graceful stop; acknowledged once the worker reaches `Closed`.
    Close(oneshot::Sender<()>),
}

/// Ownership record of one live worker, held by the router.
#[derive(Debug)]
pub struct WorkerHandle {
    id: ConnectionId,
    commands: mpsc::Sender<WorkerCommand>,
    status: watch::Receiver<ConnectionStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
    diagnostics: SpawnDiagnostics,
    last_activity: Mutex<Instant>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: ConnectionId,
        commands: mpsc::Sender<WorkerCommand>,
        status: watch::Receiver<ConnectionStatus>,
        task: JoinHandle<()>,
        diagnostics: SpawnDiagnostics,
        now: Instant,
    ) -> Self {
        Self {
            id,
            commands,
            status,
            task: Mutex::new(Some(task)),
            diagnostics,
            last_activity: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch stream of status transitions for external monitoring.
    pub fn status_stream(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.status().is_terminal() || self.commands.is_closed()
    }

    pub fn diagnostics(&self) -> &SpawnDiagnostics {
        &self.diagnostics
    }

    /// Enqueue a command without waiting. Mailbox overflow is surfaced to
    /// the caller, never to the worker.
    pub fn try_command(
        &self,
        command: WorkerCommand,
    ) -> Result<(), mpsc::error::TrySendError<WorkerCommand>> {
        self.commands.try_send(command)
    }

    pub fn touch(&self, now: Instant) {
        *self.last_activity.lock() = now;
    }

    pub fn idle_since(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Graceful close bounded by the grace period; the task is aborted if
    /// it does not reach `Closed` in time.
    pub async fn close(&self, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        let closed = tokio::time::timeout(grace, async {
            if self
                .commands
                .send(WorkerCommand::Close(done_tx))
                .await
                .is_ok()
            {
                let _ = done_rx.await;
            }
        })
        .await
        .is_ok();
        if !closed {
            warn!(connection = %self.id, "close grace exceeded; aborting worker task");
        }
        if let Some(task) = self.task.lock().take() {
            if closed {
                drop(task);
            } else {
                task.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker runtime
// ---------------------------------------------------------------------------

/// Mutable state owned by one worker task.
pub(crate) struct WorkerRuntime<C: Clock> {
    pub(crate) descriptor: ConnectionDescriptor,
    pub(crate) pipeline: MappingPipeline,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) processor: Arc<dyn SignalProcessor>,
    pub(crate) registry: Arc<MapperRegistry>,
    pub(crate) dispatcher: OutboundDispatcher,
    pub(crate) events: Arc<ConnectionEvents>,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) timeouts: WorkerTimeouts,
    pub(crate) reconnect_policy: RestartPolicy,
    pub(crate) clock: C,
}

enum LoopEvent {
    Command(Option<WorkerCommand>),
    Inbound(Option<Result<crate::signal::ExternalMessage, transport::TransportError>>),
}

impl<C: Clock> WorkerRuntime<C> {
    fn set_state(&self, state: ConnectionStatus) {
        self.events.record(&self.descriptor.id, state);
        let _ = self.status.send(state);
    }

    async fn handle_inbound(&self, envelope: InboundEnvelope) {
        let output = self.pipeline.map_inbound(&envelope.message);
        if output.is_empty() {
            debug!(
                connection = %self.descriptor.id,
                "inbound message yielded no signals; dropped"
            );
            return;
        }
        for signal in output.signals {
            self.processor.accept(signal).await;
        }
        for failure in output.failures {
            let response = ErrorResponse::from_mapping_failure(&failure);
            self.processor.accept(response.into_signal()).await;
        }
    }

    /// Dispatch one outbound context; returns true when the failure means
    /// the transport itself is gone.
    async fn handle_dispatch(
        &self,
        context: SendingContext,
        connection: &mut Box<dyn Connection>,
    ) -> bool {
        let entity_hint = context.signal.header("entity-id").map(str::to_string);
        let outcome = self
            .dispatcher
            .dispatch(context, &self.pipeline, Some(connection))
            .await;
        match outcome {
            Outcome::Failed {
                error:
                    DispatchError::Transport {
                        fault,
                        user_indicated,
                    },
            } => {
                if user_indicated {
                    // The caller's fault: answer the requester, do not retry.
                    let response = ErrorResponse::from_fault(&fault, entity_hint.as_deref());
                    self.processor.accept(response.into_signal()).await;
                    false
                } else {
                    is_connection_loss_kind(&fault.kind)
                }
            }
            _ => false,
        }
    }

    fn apply_descriptor(&mut self, descriptor: ConnectionDescriptor) -> Result<(), MappingError> {
        let pipeline = MappingPipeline::build(&descriptor.mappers, &self.registry)?;
        self.descriptor = descriptor;
        self.pipeline = pipeline;
        Ok(())
    }

    /// Re-establish the transport with capped backoff, staying responsive
    /// to mailbox commands while waiting between attempts.
    ///
    /// Returns `None` when the worker terminated instead (close requested,
    /// mailbox dropped, or the local retry budget ran out).
    async fn reestablish(
        &mut self,
        state: ConnectionStatus,
        mailbox: &mut mpsc::Receiver<WorkerCommand>,
    ) -> Option<Box<dyn Connection>> {
        self.set_state(state);
        let mut retry = RetryState::new();
        loop {
            let attempt = tokio::time::timeout(
                self.timeouts.init_deadline(),
                self.transport.open(&self.descriptor),
            )
            .await;
            match attempt {
                Ok(Ok(connection)) => {
                    self.set_state(ConnectionStatus::Connected);
                    return Some(connection);
                }
                Ok(Err(err)) => {
                    warn!(connection = %self.descriptor.id, error = %err, "reconnect attempt failed");
                }
                Err(_) => {
                    warn!(connection = %self.descriptor.id, "reconnect attempt exceeded deadline");
                }
            }
            let delay = retry.record_failure(&self.reconnect_policy, self.clock.now());
            if retry.exhausted(&self.reconnect_policy) {
                warn!(
                    connection = %self.descriptor.id,
                    attempts = retry.consecutive_failures,
                    "reconnect budget exhausted; worker terminating"
                );
                self.shutdown(None, mailbox, None).await;
                return None;
            }
            let sleep = self.clock.sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    cmd = mailbox.recv() => match cmd {
                        // Inbound mapping needs no live transport.
                        Some(WorkerCommand::Inbound(envelope)) => {
                            self.handle_inbound(envelope).await;
                        }
                        Some(WorkerCommand::Dispatch(context)) => {
                            let _ = self
                                .dispatcher
                                .dispatch(context, &self.pipeline, None)
                                .await;
                        }
                        Some(WorkerCommand::UpdateDescriptor(descriptor)) => {
                            match self.apply_descriptor(descriptor) {
                                Ok(()) => retry.reset(),
                                Err(err) => {
                                    warn!(
                                        connection = %self.descriptor.id,
                                        error = %err,
                                        "descriptor update rejected during reconnect"
                                    );
                                }
                            }
                        }
                        Some(WorkerCommand::Close(done)) => {
                            self.shutdown(None, mailbox, Some(done)).await;
                            return None;
                        }
                        None => {
                            self.shutdown(None, mailbox, None).await;
                            return None;
                        }
                    },
                }
            }
        }
    }

    /// Drain in-flight sends within the grace period, cancel the rest,
    /// release the transport, and reach `Closed`.
    async fn shutdown(
        &self,
        connection: Option<Box<dyn Connection>>,
        mailbox: &mut mpsc::Receiver<WorkerCommand>,
        done: Option<oneshot::Sender<()>>,
    ) {
        self.set_state(ConnectionStatus::Closing);
        mailbox.close();
        let mut closers: Vec<oneshot::Sender<()>> = Vec::new();
        if let Some(done) = done {
            closers.push(done);
        }
        let mut connection = connection;

        let grace = self.clock.sleep(self.timeouts.close_grace());
        tokio::pin!(grace);
        loop {
            tokio::select! {
                () = &mut grace => break,
                cmd = mailbox.recv() => match cmd {
                    Some(WorkerCommand::Dispatch(context)) => match connection.as_mut() {
                        Some(conn) => {
                            let _ = self
                                .dispatcher
                                .dispatch(context, &self.pipeline, Some(conn))
                                .await;
                        }
                        None => context.resolve_cancelled(),
                    },
                    Some(WorkerCommand::Inbound(envelope)) => {
                        self.handle_inbound(envelope).await;
                    }
                    Some(WorkerCommand::Close(tx)) => closers.push(tx),
                    Some(WorkerCommand::UpdateDescriptor(_)) => {}
                    None => break,
                },
            }
        }
        // Whatever the grace period did not drain resolves as cancelled.
        while let Ok(cmd) = mailbox.try_recv() {
            match cmd {
                WorkerCommand::Dispatch(context) => context.resolve_cancelled(),
                WorkerCommand::Close(tx) => closers.push(tx),
                WorkerCommand::Inbound(_) | WorkerCommand::UpdateDescriptor(_) => {}
            }
        }
        if let Some(mut conn) = connection {
            conn.close().await;
        }
        self.set_state(ConnectionStatus::Closed);
        for tx in closers {
            let _ = tx.send(());
        }
    }
}

/// The worker task body. Strictly sequential per connection.
pub(crate) async fn run<C: Clock>(
    mut runtime: WorkerRuntime<C>,
    mut mailbox: mpsc::Receiver<WorkerCommand>,
    mut connection: Box<dyn Connection>,
) {
    runtime.set_state(ConnectionStatus::Connected);
    loop {
        let event = tokio::select! {
            cmd = mailbox.recv() => LoopEvent::Command(cmd),
            msg = connection.recv() => LoopEvent::Inbound(msg),
        };
        match event {
            LoopEvent::Command(Some(WorkerCommand::Inbound(envelope))) => {
                runtime.handle_inbound(envelope).await;
            }
            LoopEvent::Command(Some(WorkerCommand::Dispatch(context))) => {
                let lost = runtime.handle_dispatch(context, &mut connection).await;
                if lost {
                    connection.close().await;
                    match runtime
                        .reestablish(ConnectionStatus::Reconnecting, &mut mailbox)
                        .await
                    {
                        Some(fresh) => connection = fresh,
                        None => return,
                    }
                }
            }
            LoopEvent::Command(Some(WorkerCommand::UpdateDescriptor(descriptor))) => {
                // No partial reconfiguration: full close and reconnect
                // with the new descriptor.
                runtime.set_state(ConnectionStatus::Closing);
                connection.close().await;
                if let Err(err) = runtime.apply_descriptor(descriptor) {
                    warn!(
                        connection = %runtime.descriptor.id,
                        error = %err,
                        "descriptor update rejected; worker terminating"
                    );
                    runtime.shutdown(None, &mut mailbox, None).await;
                    return;
                }
                match runtime
                    .reestablish(ConnectionStatus::Connecting, &mut mailbox)
                    .await
                {
                    Some(fresh) => connection = fresh,
                    None => return,
                }
            }
            LoopEvent::Command(Some(WorkerCommand::Close(done))) => {
                runtime
                    .shutdown(Some(connection), &mut mailbox, Some(done))
                    .await;
                return;
            }
            LoopEvent::Command(None) => {
                // Every sender dropped: the handle is gone, stop cleanly.
                runtime.shutdown(Some(connection), &mut mailbox, None).await;
                return;
            }
            LoopEvent::Inbound(Some(Ok(message))) => {
                runtime.handle_inbound(InboundEnvelope::new(message)).await;
            }
            LoopEvent::Inbound(Some(Err(err))) => {
                if err.kind.is_connection_loss() {
                    warn!(connection = %runtime.descriptor.id, error = %err, "transport failure detected");
                    connection.close().await;
                    match runtime
                        .reestablish(ConnectionStatus::Reconnecting, &mut mailbox)
                        .await
                    {
                        Some(fresh) => connection = fresh,
                        None => return,
                    }
                } else {
                    warn!(connection = %runtime.descriptor.id, error = %err, "inbound message error; skipping frame");
                }
            }
            LoopEvent::Inbound(None) => {
                warn!(connection = %runtime.descriptor.id, "inbound stream ended; reconnecting");
                connection.close().await;
                match runtime
                    .reestablish(ConnectionStatus::Reconnecting, &mut mailbox)
                    .await
                {
                    Some(fresh) => connection = fresh,
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ConditionSpec, MapperSpec};

    #[test]
    fn test_creation_args_round_trip() {
        let id = ConnectionId::parse("conn-serialized").unwrap();
        let descriptor = ConnectionDescriptor::new(id, "amqp://broker:5672")
            .with_setting("vhost", "iot")
            .with_mapper(
                MapperSpec::new("duplicating")
                    .with_option("count", "2")
                    .with_inbound_condition(ConditionSpec::eq("source", "edge")),
            );
        let mut args = CreationArgs::new(
            descriptor,
            ActorRef::new("tether://node-1/processor"),
            ActorRef::new("tether://node-1/connections/conn-serialized"),
        );
        args.request_headers
            .insert("correlation-id".into(), "r-42".into());
        args.overwrites
            .insert("uri".into(), serde_json::json!("amqp://failover:5672"));

        let encoded = serde_json::to_string(&args).unwrap();
        let decoded: CreationArgs = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, args);

        // A second pass produces the identical wire form.
        let reencoded = serde_json::to_string(&decoded).unwrap();
        let redecoded: CreationArgs = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(redecoded, args);
    }

    #[test]
    fn test_actor_ref_is_opaque() {
        let actor = ActorRef::new("tether://node-2/notify");
        assert_eq!(actor.0, "tether://node-2/notify");
    }
}
