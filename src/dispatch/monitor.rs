//! Monitor sinks for send-disposition accounting.
//!
//! Every dispositioned send produces exactly one monitor call: a benign
//! drop is recorded as `success` on the dropped monitor, an unresolved
//! target or failed send as `failure` on its category. External monitoring
//! backends plug in through [`MonitorSink`]; the builtin counting sink is
//! enough for tests and snapshot-style telemetry.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::signal::Adaptable;

/// Observability sink for one outcome category.
pub trait MonitorSink: Send + Sync {
    fn success(&self, signal: &Adaptable, message: &str, details: &[&str]);
    fn failure(&self, signal: &Adaptable, message: &str, details: &[&str]);
}

/// Outcome categories tracked per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCategory {
    Published,
    Acknowledged,
    Dropped,
}

impl MonitorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Acknowledged => "acknowledged",
            Self::Dropped => "dropped",
        }
    }
}

/// The three monitors attached to every sending context.
#[derive(Clone)]
pub struct ConnectionMonitors {
    pub published: Arc<dyn MonitorSink>,
    pub acknowledged: Arc<dyn MonitorSink>,
    pub dropped: Arc<dyn MonitorSink>,
}

impl ConnectionMonitors {
    /// Monitors that record nothing. Useful when a caller opts out of
    /// accounting for fire-and-forget sends.
    pub fn disabled() -> Self {
        let sink: Arc<dyn MonitorSink> = Arc::new(NoopSink);
        Self {
            published: sink.clone(),
            acknowledged: sink.clone(),
            dropped: sink,
        }
    }

    /// Counting monitors sharing one counter block; returns the monitors
    /// and a handle for snapshots.
    pub fn counting() -> (Self, Arc<MonitorCounters>) {
        let counters = Arc::new(MonitorCounters::default());
        let monitors = Self {
            published: Arc::new(CountingSink {
                category: MonitorCategory::Published,
                counters: counters.clone(),
            }),
            acknowledged: Arc::new(CountingSink {
                category: MonitorCategory::Acknowledged,
                counters: counters.clone(),
            }),
            dropped: Arc::new(CountingSink {
                category: MonitorCategory::Dropped,
                counters: counters.clone(),
            }),
        };
        (monitors, counters)
    }
}

struct NoopSink;

impl MonitorSink for NoopSink {
    fn success(&self, _signal: &Adaptable, _message: &str, _details: &[&str]) {}
    fn failure(&self, _signal: &Adaptable, _message: &str, _details: &[&str]) {}
}

/// Atomic counters per category, with the most recent failure retained for
/// diagnostics.
#[derive(Default)]
pub struct MonitorCounters {
    published_ok: AtomicU64,
    published_failed: AtomicU64,
    acknowledged_ok: AtomicU64,
    acknowledged_failed: AtomicU64,
    dropped_ok: AtomicU64,
    dropped_failed: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl MonitorCounters {
    fn record(&self, category: MonitorCategory, ok: bool, message: &str) {
        let counter = match (category, ok) {
            (MonitorCategory::Published, true) => &self.published_ok,
            (MonitorCategory::Published, false) => &self.published_failed,
            (MonitorCategory::Acknowledged, true) => &self.acknowledged_ok,
            (MonitorCategory::Acknowledged, false) => &self.acknowledged_failed,
            (MonitorCategory::Dropped, true) => &self.dropped_ok,
            (MonitorCategory::Dropped, false) => &self.dropped_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if !ok {
            *self.last_failure.lock() = Some(format!("{}: {message}", category.as_str()));
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            published_ok: self.published_ok.load(Ordering::Relaxed),
            published_failed: self.published_failed.load(Ordering::Relaxed),
            acknowledged_ok: self.acknowledged_ok.load(Ordering::Relaxed),
            acknowledged_failed: self.acknowledged_failed.load(Ordering::Relaxed),
            dropped_ok: self.dropped_ok.load(Ordering::Relaxed),
            dropped_failed: self.dropped_failed.load(Ordering::Relaxed),
            last_failure: self.last_failure.lock().clone(),
        }
    }
}

/// Point-in-time view of the monitor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub published_ok: u64,
    pub published_failed: u64,
    pub acknowledged_ok: u64,
    pub acknowledged_failed: u64,
    pub dropped_ok: u64,
    pub dropped_failed: u64,
    pub last_failure: Option<String>,
}

struct CountingSink {
    category: MonitorCategory,
    counters: Arc<MonitorCounters>,
}

impl MonitorSink for CountingSink {
    fn success(&self, signal: &Adaptable, message: &str, _details: &[&str]) {
        debug!(
            category = self.category.as_str(),
            topic = %signal.topic,
            message,
            "send disposition"
        );
        self.counters.record(self.category, true, message);
    }

    fn failure(&self, signal: &Adaptable, message: &str, _details: &[&str]) {
        debug!(
            category = self.category.as_str(),
            topic = %signal.topic,
            message,
            "send disposition failure"
        );
        self.counters.record(self.category, false, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_monitors_track_categories_independently() {
        let (monitors, counters) = ConnectionMonitors::counting();
        let signal = Adaptable::new("t");

        monitors.published.success(&signal, "sent", &[]);
        monitors.published.success(&signal, "sent", &[]);
        monitors.acknowledged.success(&signal, "acked", &[]);
        monitors.dropped.failure(&signal, "unresolved", &[]);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.published_ok, 2);
        assert_eq!(snapshot.acknowledged_ok, 1);
        assert_eq!(snapshot.dropped_failed, 1);
        assert_eq!(snapshot.published_failed, 0);
        assert_eq!(
            snapshot.last_failure.as_deref(),
            Some("dropped: unresolved")
        );
    }

    #[test]
    fn test_disabled_monitors_record_nothing() {
        let monitors = ConnectionMonitors::disabled();
        monitors.published.failure(&Adaptable::new("t"), "x", &[]);
        // No counters exist; just proving the call is accepted.
    }
}
