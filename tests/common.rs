//! Common test harness utilities for integration tests.
//!
//! This module provides:
//! - A scripted in-memory transport with controllable open/send behavior
//! - A recording downstream signal processor
//! - An in-memory descriptor source
//! - Fixture builders with fast timings
//!
//! All helpers use only existing dependencies.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tether::worker::transport::TransportErrorKind;
use tether::{
    Adaptable, Connection, ConnectionDescriptor, ConnectionId, DescriptorSource, ExternalMessage,
    MapperSpec, RestartPolicy, SendReceipt, SignalProcessor, SystemClock, Transport,
    TransportError, WorkerSupervisor, WorkerTimeouts,
};

type InboundFeed = mpsc::UnboundedSender<Result<ExternalMessage, TransportError>>;

/// Shared state backing [`TestTransport`] and its connections.
#[derive(Default)]
pub struct TransportState {
    /// Remaining open attempts that must fail before one succeeds.
    fail_opens: AtomicU32,
    /// When set, every open fails.
    always_fail: AtomicBool,
    /// Total open attempts, successful or not.
    opens: AtomicU32,
    /// Extra latency applied to each open.
    open_delay_ms: AtomicU32,
    /// Errors popped one per send.
    send_errors: Mutex<VecDeque<TransportError>>,
    /// Whether sends report broker acknowledgement.
    acknowledge: AtomicBool,
    /// Everything successfully sent over any connection.
    sent: Mutex<Vec<ExternalMessage>>,
    /// Inbound feed of the most recently opened connection.
    inbound: Mutex<Option<InboundFeed>>,
}

impl TransportState {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_opens(&self, enabled: bool) {
        self.always_fail.store(enabled, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn set_acknowledge(&self, enabled: bool) {
        self.acknowledge.store(enabled, Ordering::SeqCst);
    }

    pub fn push_send_error(&self, error: TransportError) {
        self.send_errors.lock().push_back(error);
    }

    pub fn sent(&self) -> Vec<ExternalMessage> {
        self.sent.lock().clone()
    }

    /// Feed an inbound message (or stream error) into the live connection.
    pub fn feed_inbound(&self, item: Result<ExternalMessage, TransportError>) {
        if let Some(feed) = self.inbound.lock().as_ref() {
            let _ = feed.send(item);
        }
    }
}

/// In-memory transport; every open produces a connection wired back to the
/// shared state.
#[derive(Clone, Default)]
pub struct TestTransport {
    pub state: Arc<TransportState>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn open(
        &self,
        _descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.state.always_fail.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                "scripted open failure",
            ));
        }
        let remaining = self.state.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                "scripted open failure",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.inbound.lock() = Some(tx);
        Ok(Box::new(TestConnection {
            state: self.state.clone(),
            inbound: rx,
        }))
    }
}

pub struct TestConnection {
    state: Arc<TransportState>,
    inbound: mpsc::UnboundedReceiver<Result<ExternalMessage, TransportError>>,
}

#[async_trait]
impl Connection for TestConnection {
    async fn send(&mut self, message: &ExternalMessage) -> Result<SendReceipt, TransportError> {
        if let Some(error) = self.state.send_errors.lock().pop_front() {
            return Err(error);
        }
        self.state.sent.lock().push(message.clone());
        if self.state.acknowledge.load(Ordering::SeqCst) {
            Ok(SendReceipt::acknowledged())
        } else {
            Ok(SendReceipt::published())
        }
    }

    async fn recv(&mut self) -> Option<Result<ExternalMessage, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {}
}

/// Downstream processor recording every accepted signal.
#[derive(Default)]
pub struct RecordingProcessor {
    signals: Mutex<Vec<Adaptable>>,
    accepted: AtomicU32,
    /// Delay applied inside accept, to simulate a slow downstream.
    accept_delay_ms: AtomicU32,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_accept_delay(&self, delay: Duration) {
        self.accept_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn signals(&self) -> Vec<Adaptable> {
        self.signals.lock().clone()
    }

    pub fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Poll until `count` signals arrived or the timeout elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.signals.lock().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SignalProcessor for RecordingProcessor {
    async fn accept(&self, signal: Adaptable) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        let delay = self.accept_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        self.signals.lock().push(signal);
    }
}

/// Static descriptor lookup for tests.
#[derive(Default)]
pub struct InMemoryDescriptors {
    entries: Mutex<HashMap<ConnectionId, ConnectionDescriptor>>,
}

impl InMemoryDescriptors {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, descriptor: ConnectionDescriptor) {
        self.entries
            .lock()
            .insert(descriptor.id.clone(), descriptor);
    }
}

impl DescriptorSource for InMemoryDescriptors {
    fn descriptor(&self, id: &ConnectionId) -> Option<ConnectionDescriptor> {
        self.entries.lock().get(id).cloned()
    }
}

pub fn conn_id(raw: &str) -> ConnectionId {
    ConnectionId::parse(raw).expect("test connection id")
}

/// Descriptor with a single pass-through mapper.
pub fn descriptor(id: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::new(conn_id(id), "test://broker")
        .with_mapper(MapperSpec::new("passthrough"))
}

/// Fast retry/timeout settings so failure paths resolve in milliseconds.
pub fn fast_timeouts() -> WorkerTimeouts {
    WorkerTimeouts {
        init_deadline_ms: 1_000,
        close_grace_ms: 250,
        creation_wait_ms: 2_000,
    }
}

pub fn fast_init_policy(ceiling: u32) -> RestartPolicy {
    RestartPolicy {
        base_delay_ms: 2,
        max_delay_ms: 20,
        ceiling: Some(ceiling),
        jitter: false,
    }
}

pub fn fast_reconnect_policy() -> RestartPolicy {
    RestartPolicy {
        base_delay_ms: 2,
        max_delay_ms: 20,
        ceiling: None,
        jitter: false,
    }
}

/// Supervisor wired to the test transport and processor with fast timings.
pub fn supervisor(
    transport: &TestTransport,
    processor: &Arc<RecordingProcessor>,
) -> WorkerSupervisor<SystemClock> {
    WorkerSupervisor::new(
        Arc::new(transport.clone()),
        processor.clone(),
        SystemClock,
    )
    .with_timeouts(fast_timeouts())
    .with_init_policy(fast_init_policy(5))
    .with_reconnect_policy(fast_reconnect_policy())
}
