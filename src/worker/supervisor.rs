//! Worker creation with restart-on-failure supervision.
//!
//! Initialization failures (the transport cannot be established at all)
//! are retried with exponential backoff up to the policy ceiling and then
//! escalated to the caller. Steady-state failures are the worker's own
//! business and follow the separate reconnect policy.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::core::config::{ConnectionDescriptor, ConnectionId, RestartPolicy, WorkerTimeouts};
use crate::core::time::Clock;
use crate::dispatch::OutboundDispatcher;
use crate::faults::FaultClassifier;
use crate::mapping::{MapperRegistry, MappingError, MappingPipeline};
use crate::ops::{ConnectionEvents, ConnectionStatus};
use crate::worker::transport::{Transport, TransportError};
use crate::worker::{SignalProcessor, WorkerHandle, WorkerRuntime};

/// Per-worker restart accounting.
///
/// Threaded explicitly through the spawn loop; reset to zero on every
/// successful start. Mutated only by the supervisor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    /// Consecutive failures since the last successful start.
    pub consecutive_failures: u32,
    /// Delay that was applied after the most recent failure.
    pub next_delay: Duration,
    /// When the most recent failure happened.
    pub last_failure: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure and return the delay to apply before the next
    /// attempt.
    pub fn record_failure(&mut self, policy: &RestartPolicy, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let mut delay = backoff_delay(policy, self.consecutive_failures);
        if policy.jitter {
            delay = jittered(delay);
        }
        self.next_delay = delay;
        self.last_failure = Some(now);
        delay
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the policy ceiling has been reached.
    pub fn exhausted(&self, policy: &RestartPolicy) -> bool {
        policy
            .ceiling
            .is_some_and(|ceiling| self.consecutive_failures >= ceiling)
    }
}

/// Backoff schedule as a pure function of the attempt count: the base
/// delay doubles per attempt and is capped at the policy maximum.
pub fn backoff_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let delay_ms = policy.base_delay_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay_ms.min(policy.max_delay_ms))
}

/// Apply +/-25% jitter to a delay so many connections failing together do
/// not reconnect in lockstep.
pub fn jittered(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    let jitter = ms / 4;
    if jitter == 0 {
        return delay;
    }
    let actual = ms + (rand_u64() % (jitter * 2)).saturating_sub(jitter);
    Duration::from_millis(actual)
}

/// Cheap pseudo-randomness derived from the wall clock; good enough to
/// de-synchronize reconnect storms.
fn rand_u64() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1)
}

/// Why a spawn attempt failed terminally.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("connection {id} unavailable after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        id: ConnectionId,
        attempts: u32,
        last_error: String,
    },
    #[error("connection {id} is not active")]
    NotActive { id: ConnectionId },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Diagnostics captured at spawn time.
#[derive(Debug, Clone)]
pub struct SpawnDiagnostics {
    /// Failed initialization attempts before the successful one.
    pub failed_attempts: u32,
    pub spawned_at: Instant,
}

/// Creates, restarts, and tears down connection workers.
pub struct WorkerSupervisor<C: Clock> {
    transport: Arc<dyn Transport>,
    processor: Arc<dyn SignalProcessor>,
    registry: Arc<MapperRegistry>,
    classifier: FaultClassifier,
    events: Arc<ConnectionEvents>,
    init_policy: RestartPolicy,
    reconnect_policy: RestartPolicy,
    timeouts: WorkerTimeouts,
    mailbox_capacity: usize,
    clock: C,
}

impl<C: Clock> WorkerSupervisor<C> {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<dyn SignalProcessor>,
        clock: C,
    ) -> Self {
        Self {
            transport,
            processor,
            registry: Arc::new(MapperRegistry::with_builtins()),
            classifier: FaultClassifier::default(),
            events: Arc::new(ConnectionEvents::new()),
            init_policy: RestartPolicy::initialization(),
            reconnect_policy: RestartPolicy::steady_state(),
            timeouts: WorkerTimeouts::default(),
            mailbox_capacity: 64,
            clock,
        }
    }

    pub fn with_registry(mut self, registry: Arc<MapperRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_classifier(mut self, classifier: FaultClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_init_policy(mut self, policy: RestartPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RestartPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: WorkerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn events(&self) -> Arc<ConnectionEvents> {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<MapperRegistry> {
        self.registry.clone()
    }

    pub fn timeouts(&self) -> &WorkerTimeouts {
        &self.timeouts
    }

    /// Spawn a worker for the descriptor, retrying initialization with
    /// backoff up to the policy ceiling.
    pub async fn spawn(
        &self,
        descriptor: ConnectionDescriptor,
    ) -> Result<Arc<WorkerHandle>, SpawnError> {
        if !descriptor.is_active() {
            return Err(SpawnError::NotActive {
                id: descriptor.id.clone(),
            });
        }
        let pipeline = MappingPipeline::build(&descriptor.mappers, &self.registry)?;
        self.events
            .record(&descriptor.id, ConnectionStatus::Connecting);

        let mut retry = RetryState::new();
        let connection = loop {
            let attempt = tokio::time::timeout(
                self.timeouts.init_deadline(),
                self.transport.open(&descriptor),
            )
            .await;
            let error = match attempt {
                Ok(Ok(connection)) => break connection,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "initialization deadline exceeded".to_string(),
            };
            let delay = retry.record_failure(&self.init_policy, self.clock.now());
            if retry.exhausted(&self.init_policy) {
                warn!(
                    connection = %descriptor.id,
                    attempts = retry.consecutive_failures,
                    error = %error,
                    "initialization retries exhausted; escalating"
                );
                self.events.record(&descriptor.id, ConnectionStatus::Closed);
                return Err(SpawnError::RetriesExhausted {
                    id: descriptor.id,
                    attempts: retry.consecutive_failures,
                    last_error: error,
                });
            }
            warn!(
                connection = %descriptor.id,
                attempt = retry.consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "initialization failed; retrying with backoff"
            );
            self.clock.sleep(delay).await;
        };

        let failed_attempts = retry.consecutive_failures;
        retry.reset();

        let id = descriptor.id.clone();
        let (command_tx, command_rx) = mpsc::channel(self.mailbox_capacity);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let runtime = WorkerRuntime {
            descriptor,
            pipeline,
            transport: self.transport.clone(),
            processor: self.processor.clone(),
            registry: self.registry.clone(),
            dispatcher: OutboundDispatcher::new(self.classifier.clone()),
            events: self.events.clone(),
            status: status_tx,
            timeouts: self.timeouts.clone(),
            reconnect_policy: self.reconnect_policy.clone(),
            clock: self.clock.clone(),
        };
        let task = tokio::spawn(crate::worker::run(runtime, command_rx, connection));

        info!(connection = %id, failed_attempts, "worker spawned");
        Ok(Arc::new(WorkerHandle::new(
            id,
            command_tx,
            status_rx,
            task,
            SpawnDiagnostics {
                failed_attempts,
                spawned_at: self.clock.now(),
            },
            self.clock.now(),
        )))
    }

    /// Connectivity validation: open and immediately release a transport
    /// connection without registering a worker. The `Testing` state never
    /// transitions to `Connected`.
    pub async fn test_connection(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), TransportError> {
        self.events
            .record(&descriptor.id, ConnectionStatus::Testing);
        let attempt = tokio::time::timeout(
            self.timeouts.init_deadline(),
            self.transport.open(descriptor),
        )
        .await;
        match attempt {
            Ok(Ok(mut connection)) => {
                connection.close().await;
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::new(
                crate::worker::transport::TransportErrorKind::Timeout,
                "connectivity test exceeded deadline",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RestartPolicy {
        RestartPolicy {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            ceiling: Some(4),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(100, 1_000);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&p, 5), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&p, 30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_millis(1_000);
        for _ in 0..32 {
            let delayed = jittered(base);
            assert!(delayed >= Duration::from_millis(750));
            assert!(delayed < Duration::from_millis(1_250));
        }
    }

    #[test]
    fn test_retry_state_accounting() {
        let p = policy(10, 100);
        let mut retry = RetryState::new();
        assert!(!retry.exhausted(&p));

        let now = Instant::now();
        retry.record_failure(&p, now);
        retry.record_failure(&p, now);
        assert_eq!(retry.consecutive_failures, 2);
        assert_eq!(retry.next_delay, Duration::from_millis(20));
        assert!(!retry.exhausted(&p));

        retry.record_failure(&p, now);
        retry.record_failure(&p, now);
        assert!(retry.exhausted(&p));

        retry.reset();
        assert_eq!(retry, RetryState::new());
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let p = RestartPolicy::steady_state();
        let mut retry = RetryState::new();
        for _ in 0..1_000 {
            retry.record_failure(&p, Instant::now());
        }
        assert!(!retry.exhausted(&p));
        assert!(retry.next_delay <= p.max_delay() + p.max_delay() / 4);
    }
}
