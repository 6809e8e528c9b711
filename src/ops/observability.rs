//! Connection status events and transition accounting.
//!
//! Every worker state transition is recorded here: a structured log line
//! plus an atomic counter per state. External monitoring backends consume
//! the snapshot; no metrics exporter lives in this crate.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::core::config::ConnectionId;

/// Lifecycle state of one connection worker.
///
/// `Testing` is a side state entered for connectivity validation; it never
/// transitions to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Testing,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Testing => "testing",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Shared sink for connection status transitions.
#[derive(Debug, Default)]
pub struct ConnectionEvents {
    connecting: AtomicU64,
    connected: AtomicU64,
    reconnecting: AtomicU64,
    closing: AtomicU64,
    closed: AtomicU64,
    testing: AtomicU64,
    last_transition: Mutex<Option<LastTransition>>,
}

#[derive(Debug, Clone)]
struct LastTransition {
    connection: ConnectionId,
    status: ConnectionStatus,
    at: Instant,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one transition. Every transition is observable: one log line
    /// and one counter increment, never silently swallowed.
    pub fn record(&self, connection: &ConnectionId, status: ConnectionStatus) {
        info!(connection = %connection, status = status.as_str(), "connection status");
        let counter = match status {
            ConnectionStatus::Connecting => &self.connecting,
            ConnectionStatus::Connected => &self.connected,
            ConnectionStatus::Reconnecting => &self.reconnecting,
            ConnectionStatus::Closing => &self.closing,
            ConnectionStatus::Closed => &self.closed,
            ConnectionStatus::Testing => &self.testing,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        *self.last_transition.lock() = Some(LastTransition {
            connection: connection.clone(),
            status,
            at: Instant::now(),
        });
    }

    pub fn snapshot(&self) -> TransitionSnapshot {
        let last = self.last_transition.lock().clone();
        TransitionSnapshot {
            connecting: self.connecting.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            reconnecting: self.reconnecting.load(Ordering::Relaxed),
            closing: self.closing.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            testing: self.testing.load(Ordering::Relaxed),
            last_connection: last.as_ref().map(|t| t.connection.to_string()),
            last_status: last.as_ref().map(|t| t.status.as_str().to_string()),
            last_age_ms: last.map(|t| t.at.elapsed().as_millis() as u64),
        }
    }
}

/// Point-in-time view of the transition counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitionSnapshot {
    pub connecting: u64,
    pub connected: u64,
    pub reconnecting: u64,
    pub closing: u64,
    pub closed: u64,
    pub testing: u64,
    pub last_connection: Option<String>,
    pub last_status: Option<String>,
    pub last_age_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_counted_per_state() {
        let events = ConnectionEvents::new();
        let id = ConnectionId::parse("conn-1").unwrap();

        events.record(&id, ConnectionStatus::Connecting);
        events.record(&id, ConnectionStatus::Connected);
        events.record(&id, ConnectionStatus::Reconnecting);
        events.record(&id, ConnectionStatus::Connected);

        let snapshot = events.snapshot();
        assert_eq!(snapshot.connecting, 1);
        assert_eq!(snapshot.connected, 2);
        assert_eq!(snapshot.reconnecting, 1);
        assert_eq!(snapshot.closed, 0);
        assert_eq!(snapshot.last_status.as_deref(), Some("connected"));
        assert_eq!(snapshot.last_connection.as_deref(), Some("conn-1"));
    }

    #[test]
    fn test_terminal_state() {
        assert!(ConnectionStatus::Closed.is_terminal());
        assert!(!ConnectionStatus::Testing.is_terminal());
        assert!(!ConnectionStatus::Reconnecting.is_terminal());
    }
}
