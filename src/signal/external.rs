//! Wire-level message representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw payload received from or destined for an external broker.
///
/// Headers are case-preserving; insertion order is irrelevant. The declared
/// content type drives mapper blocklist filtering and is carried separately
/// from the header map because not every protocol models it as a header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "bytes_serde")]
    pub payload: Bytes,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ExternalMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            headers: HashMap::new(),
            payload: payload.into(),
            content_type: None,
        }
    }

    /// Convenience constructor for textual payloads.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(Bytes::from(payload.into())).with_content_type("text/plain")
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Payload decoded as UTF-8, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Serde adapter for `Bytes` payloads (serialized as a byte sequence).
mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_message_accessors() {
        let message = ExternalMessage::text("{\"v\":1}")
            .with_header("device", "thermostat-4")
            .with_content_type("application/json");
        assert_eq!(message.header("device"), Some("thermostat-4"));
        assert_eq!(message.content_type(), Some("application/json"));
        assert_eq!(message.payload_text(), Some("{\"v\":1}"));
    }

    #[test]
    fn test_external_message_serde_round_trip() {
        let message = ExternalMessage::new(vec![0x00, 0xff, 0x10])
            .with_header("origin", "bench")
            .with_content_type("application/octet-stream");
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: ExternalMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
