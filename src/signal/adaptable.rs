//! Canonical signal representation.
//!
//! An [`Adaptable`] is the internal protocol form every wire payload is
//! converted into (and produced from) by the mapping pipeline. Downstream
//! command processing only ever sees adaptables.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical signal: topic path, headers, optional payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Adaptable {
    /// Slash-separated topic path, e.g. `things/device-1/events/modified`.
    pub topic: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl Adaptable {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            headers: HashMap::new(),
            payload: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Payload as bytes for outbound conversion.
    pub fn payload_bytes(&self) -> Bytes {
        self.payload
            .as_ref()
            .map(|p| Bytes::from(p.clone().into_bytes()))
            .unwrap_or_default()
    }
}

/// Structured record of a single mapper failing on a single message.
///
/// Carried alongside the successful pipeline output so one misbehaving
/// mapper never suppresses the results of its peers.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingFailure {
    /// Alias of the mapper instance that failed.
    pub mapper: String,
    /// Declared content type of the offending message, if any.
    pub content_type: Option<String>,
    /// Human-readable diagnostic from the mapper.
    pub diagnostic: String,
}

impl MappingFailure {
    /// Render the failure as a signal so it can be routed like any other
    /// outbound candidate.
    pub fn into_signal(self) -> Adaptable {
        let mut signal = Adaptable::new("_failures/mapping")
            .with_header("mapper", self.mapper)
            .with_header("diagnostic", self.diagnostic.clone())
            .with_payload(self.diagnostic);
        if let Some(content_type) = self.content_type {
            signal.headers.insert("content-type".into(), content_type);
        }
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptable_builders() {
        let signal = Adaptable::new("things/t1/commands/modify")
            .with_header("correlation-id", "c-9")
            .with_payload("{\"temp\":21}");
        assert_eq!(signal.header("correlation-id"), Some("c-9"));
        assert_eq!(signal.payload_bytes(), Bytes::from("{\"temp\":21}"));
    }

    #[test]
    fn test_mapping_failure_signal_carries_diagnostics() {
        let failure = MappingFailure {
            mapper: "faulty".into(),
            content_type: Some("application/json".into()),
            diagnostic: "boom".into(),
        };
        let signal = failure.into_signal();
        assert_eq!(signal.topic, "_failures/mapping");
        assert_eq!(signal.header("mapper"), Some("faulty"));
        assert_eq!(signal.header("content-type"), Some("application/json"));
        assert_eq!(signal.payload.as_deref(), Some("boom"));
    }
}
