//! In-process entity router backed by a claim map.
//!
//! The map from connection id to worker slot is the only state shared
//! between routing callers. Creation is serialized per id through the
//! map's atomic entry API: the first caller installs an `Initializing`
//! claim and spawns; concurrent callers wait on the claim's readiness
//! watch. Concurrent first-messages therefore produce exactly one worker.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::core::config::{ConnectionDescriptor, ConnectionId, RouterConfig};
use crate::core::time::Clock;
use crate::dispatch::SendingContext;
use crate::routing::{DescriptorSource, EntityRouter, InboundEnvelope, RoutingError};
use crate::worker::transport::TransportError;
use crate::worker::{WorkerCommand, WorkerHandle, WorkerSupervisor};

/// Spawn progress broadcast to callers waiting on a claim.
#[derive(Debug, Clone)]
enum SpawnWait {
    Pending,
    Ready,
    Failed(String),
}

enum Slot {
    /// Claimed: a spawn is in flight; wait on the watch.
    Initializing(watch::Receiver<SpawnWait>),
    /// The unique live worker for this id.
    Live(Arc<WorkerHandle>),
}

enum SlotView {
    Initializing(watch::Receiver<SpawnWait>),
    Live(Arc<WorkerHandle>),
}

/// Map-based router used when the process is not clustered.
pub struct LocalEntityRouter<C: Clock> {
    supervisor: WorkerSupervisor<C>,
    descriptors: Arc<dyn DescriptorSource>,
    slots: DashMap<ConnectionId, Slot>,
    config: RouterConfig,
    clock: C,
}

impl<C: Clock> LocalEntityRouter<C> {
    pub fn new(
        supervisor: WorkerSupervisor<C>,
        descriptors: Arc<dyn DescriptorSource>,
        clock: C,
    ) -> Self {
        Self {
            supervisor,
            descriptors,
            slots: DashMap::new(),
            config: RouterConfig::default(),
            clock,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Live worker handle for inspection; `None` when absent or still
    /// initializing.
    pub fn handle(&self, id: &ConnectionId) -> Option<Arc<WorkerHandle>> {
        self.slots.get(id).and_then(|slot| match slot.value() {
            Slot::Live(handle) => Some(handle.clone()),
            Slot::Initializing(_) => None,
        })
    }

    /// Ids with a live (not yet terminated) worker.
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(handle) if !handle.is_terminated() => Some(entry.key().clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver an outbound send request to the worker owning `id`,
    /// spawning it if needed. Same claim discipline as inbound routing.
    pub async fn send(
        &self,
        id: &ConnectionId,
        context: SendingContext,
    ) -> Result<(), RoutingError> {
        self.deliver(id, WorkerCommand::Dispatch(context)).await
    }

    /// Push a new descriptor to a live worker, forcing a full
    /// close/reconnect cycle. A no-op when no worker is live; the next
    /// spawn reads the descriptor source anyway.
    pub fn update(&self, descriptor: ConnectionDescriptor) -> Result<(), RoutingError> {
        let Some(handle) = self.handle(&descriptor.id) else {
            debug!(connection = %descriptor.id, "descriptor update with no live worker");
            return Ok(());
        };
        let id = descriptor.id.clone();
        handle
            .try_command(WorkerCommand::UpdateDescriptor(descriptor))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RoutingError::Backpressure(id),
                mpsc::error::TrySendError::Closed(_) => RoutingError::UnknownConnection(id),
            })
    }

    /// Run the connectivity validation side state for a descriptor without
    /// registering a worker.
    pub async fn test_connection(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), TransportError> {
        self.supervisor.test_connection(descriptor).await
    }

    /// Drop handles of terminated workers so the next message respawns.
    pub fn sweep(&self) {
        self.slots
            .retain(|_, slot| !matches!(slot, Slot::Live(handle) if handle.is_terminated()));
    }

    /// Close workers that have been idle past the configured threshold.
    /// Returns the ids that were evicted.
    pub async fn evict_idle(&self) -> Vec<ConnectionId> {
        let now = self.clock.now();
        let max_idle = self.config.max_idle();
        let idle: Vec<Arc<WorkerHandle>> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(handle)
                    if now.saturating_duration_since(handle.idle_since()) >= max_idle =>
                {
                    Some(handle.clone())
                }
                _ => None,
            })
            .collect();
        let mut evicted = Vec::with_capacity(idle.len());
        for handle in idle {
            let id = handle.id().clone();
            self.remove_live(&id, &handle);
            handle
                .close(self.supervisor.timeouts().close_grace())
                .await;
            evicted.push(id);
        }
        evicted
    }

    async fn deliver(
        &self,
        id: &ConnectionId,
        command: WorkerCommand,
    ) -> Result<(), RoutingError> {
        let mut command = Some(command);
        loop {
            let current = self.slots.get(id).map(|slot| match slot.value() {
                Slot::Live(handle) => SlotView::Live(handle.clone()),
                Slot::Initializing(rx) => SlotView::Initializing(rx.clone()),
            });
            match current {
                Some(SlotView::Live(handle)) => {
                    if handle.is_terminated() {
                        self.remove_live(id, &handle);
                        continue;
                    }
                    match handle.try_command(command.take().expect("command consumed once")) {
                        Ok(()) => {
                            handle.touch(self.clock.now());
                            return Ok(());
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            return Err(RoutingError::Backpressure(id.clone()));
                        }
                        Err(mpsc::error::TrySendError::Closed(rejected)) => {
                            command = Some(rejected);
                            self.remove_live(id, &handle);
                            continue;
                        }
                    }
                }
                Some(SlotView::Initializing(mut ready)) => {
                    let outcome = tokio::time::timeout(
                        self.supervisor.timeouts().creation_wait(),
                        ready.wait_for(|state| !matches!(state, SpawnWait::Pending)),
                    )
                    .await;
                    match outcome {
                        Err(_) => return Err(RoutingError::CreationTimeout(id.clone())),
                        // Spawner dropped the watch without resolving it:
                        // clear the stale claim and retry.
                        Ok(Err(_)) => {
                            self.release_claim(id);
                            continue;
                        }
                        Ok(Ok(state)) => match state.clone() {
                            SpawnWait::Ready => continue,
                            SpawnWait::Failed(reason) => {
                                return Err(RoutingError::ConnectionUnavailable {
                                    id: id.clone(),
                                    reason,
                                });
                            }
                            SpawnWait::Pending => continue,
                        },
                    }
                }
                None => {
                    let claimed = {
                        match self.slots.entry(id.clone()) {
                            Entry::Occupied(_) => None,
                            Entry::Vacant(vacant) => {
                                let (ready_tx, ready_rx) = watch::channel(SpawnWait::Pending);
                                vacant.insert(Slot::Initializing(ready_rx));
                                Some(ready_tx)
                            }
                        }
                    };
                    let Some(ready_tx) = claimed else {
                        continue;
                    };
                    self.spawn_claimed(id, ready_tx).await?;
                }
            }
        }
    }

    /// The claim-winning caller spawns the worker and resolves the claim.
    async fn spawn_claimed(
        &self,
        id: &ConnectionId,
        ready_tx: watch::Sender<SpawnWait>,
    ) -> Result<(), RoutingError> {
        let descriptor = match self.descriptors.descriptor(id) {
            Some(descriptor) if descriptor.is_active() => descriptor,
            _ => {
                self.release_claim(id);
                let _ = ready_tx.send(SpawnWait::Failed("connection is not configured".into()));
                return Err(RoutingError::UnknownConnection(id.clone()));
            }
        };
        let spawn = tokio::time::timeout(
            self.supervisor.timeouts().creation_wait(),
            self.supervisor.spawn(descriptor),
        )
        .await;
        match spawn {
            Ok(Ok(handle)) => {
                let mut installed = false;
                if let Some(mut slot) = self.slots.get_mut(id) {
                    if matches!(slot.value(), Slot::Initializing(_)) {
                        *slot.value_mut() = Slot::Live(handle.clone());
                        installed = true;
                    }
                }
                if installed {
                    let _ = ready_tx.send(SpawnWait::Ready);
                    Ok(())
                } else {
                    // The claim was removed while we were spawning (an
                    // explicit close raced in); stop the fresh worker.
                    let reason = "connection closed during initialization".to_string();
                    let _ = ready_tx.send(SpawnWait::Failed(reason.clone()));
                    handle
                        .close(self.supervisor.timeouts().close_grace())
                        .await;
                    Err(RoutingError::ConnectionUnavailable {
                        id: id.clone(),
                        reason,
                    })
                }
            }
            Ok(Err(err)) => {
                self.release_claim(id);
                let reason = err.to_string();
                let _ = ready_tx.send(SpawnWait::Failed(reason.clone()));
                Err(RoutingError::ConnectionUnavailable {
                    id: id.clone(),
                    reason,
                })
            }
            Err(_) => {
                self.release_claim(id);
                let _ = ready_tx.send(SpawnWait::Failed("initialization timed out".into()));
                Err(RoutingError::CreationTimeout(id.clone()))
            }
        }
    }

    fn release_claim(&self, id: &ConnectionId) {
        self.slots
            .remove_if(id, |_, slot| matches!(slot, Slot::Initializing(_)));
    }

    fn remove_live(&self, id: &ConnectionId, handle: &Arc<WorkerHandle>) {
        self.slots.remove_if(id, |_, slot| {
            matches!(slot, Slot::Live(existing) if Arc::ptr_eq(existing, handle))
        });
    }

    fn close_grace(&self) -> Duration {
        self.supervisor.timeouts().close_grace()
    }
}

#[async_trait::async_trait]
impl<C: Clock> EntityRouter for LocalEntityRouter<C> {
    async fn route(
        &self,
        id: &ConnectionId,
        envelope: InboundEnvelope,
    ) -> Result<(), RoutingError> {
        self.deliver(id, WorkerCommand::Inbound(envelope)).await
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), RoutingError> {
        match self.slots.remove(id) {
            Some((_, Slot::Live(handle))) => {
                handle.close(self.close_grace()).await;
                Ok(())
            }
            // The spawner notices its claim is gone and stops the worker.
            Some((_, Slot::Initializing(_))) => Ok(()),
            None => Err(RoutingError::UnknownConnection(id.clone())),
        }
    }
}
