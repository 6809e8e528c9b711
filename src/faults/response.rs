//! Conversion of internal faults into bounded, typed error responses.

use serde::{Deserialize, Serialize};

use crate::faults::classifier::Fault;
use crate::signal::{Adaptable, MappingFailure};

/// Sentinel entity identifier used when the offending identifier failed
/// validation. Fixed form: `unknown:unknown`.
pub const UNKNOWN_ENTITY_ID: &str = "unknown:unknown";

/// Upper bound on the serialized size of one error response.
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024;

const TRUNCATION_MARKER: &str = "...[truncated]";

/// Structured error response addressed back to the original requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Entity the fault is scoped to; `unknown:unknown` when the original
    /// identifier was invalid.
    pub entity_id: String,
    /// HTTP-like status for downstream consumers.
    pub status: u16,
    /// Stable machine-readable code derived from the fault kind.
    pub error_code: String,
    pub message: String,
}

impl ErrorResponse {
    /// Build a response from a generic fault carrying an offending entity
    /// identifier. An identifier that fails validation falls back to the
    /// documented sentinel rather than leaking the malformed value.
    pub fn from_fault(fault: &Fault, entity_id: Option<&str>) -> Self {
        let entity_id = entity_id
            .filter(|id| is_valid_entity_id(id))
            .unwrap_or(UNKNOWN_ENTITY_ID)
            .to_string();
        Self {
            entity_id,
            status: 400,
            error_code: format!("connectivity:{}", fault.kind),
            message: fault
                .message
                .clone()
                .unwrap_or_else(|| fault.kind.clone()),
        }
    }

    pub fn from_mapping_failure(failure: &MappingFailure) -> Self {
        Self {
            entity_id: UNKNOWN_ENTITY_ID.to_string(),
            status: 400,
            error_code: "connectivity:mapping-failed".to_string(),
            message: match &failure.content_type {
                Some(ct) => format!("mapper {:?} failed on {ct}: {}", failure.mapper, failure.diagnostic),
                None => format!("mapper {:?} failed: {}", failure.mapper, failure.diagnostic),
            },
        }
    }

    /// Render the response as a canonical signal for outbound routing.
    pub fn into_signal(self) -> Adaptable {
        let payload = self.to_bounded_json();
        Adaptable::new(format!("_errors/{}", self.entity_id))
            .with_header("error-code", self.error_code)
            .with_header("status", self.status.to_string())
            .with_payload(payload)
    }

    /// Serialize to JSON, never exceeding [`MAX_RESPONSE_BYTES`].
    ///
    /// Oversized responses are truncated deterministically: the message
    /// field is cut at a character boundary and suffixed with a fixed
    /// marker, rather than dropping the response.
    pub fn to_bounded_json(&self) -> String {
        let encoded = serde_json::to_string(self).unwrap_or_default();
        if encoded.len() <= MAX_RESPONSE_BYTES {
            return encoded;
        }

        let overshoot = encoded.len() - MAX_RESPONSE_BYTES;
        let budget = self
            .message
            .len()
            .saturating_sub(overshoot + TRUNCATION_MARKER.len());
        let cut = self
            .message
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= budget)
            .last()
            .unwrap_or(0);
        let truncated = Self {
            message: format!("{}{}", &self.message[..cut], TRUNCATION_MARKER),
            ..self.clone()
        };
        serde_json::to_string(&truncated).unwrap_or_default()
    }
}

/// Entity identifiers follow a `namespace:name` shape with the same
/// character set as connection ids.
fn is_valid_entity_id(id: &str) -> bool {
    let Some((namespace, name)) = id.split_once(':') else {
        return false;
    };
    let part_ok = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    };
    part_ok(namespace) && part_ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_entity_id_preserved() {
        let fault = Fault::new("rejected", Some("no such feature".into()));
        let response = ErrorResponse::from_fault(&fault, Some("org.acme:device-1"));
        assert_eq!(response.entity_id, "org.acme:device-1");
        assert_eq!(response.error_code, "connectivity:rejected");
        assert_eq!(response.message, "no such feature");
    }

    #[test]
    fn test_invalid_entity_id_falls_back_to_sentinel() {
        let fault = Fault::new("rejected", None);
        for bad in [None, Some("no-colon"), Some(":empty"), Some("spaces :x")] {
            let response = ErrorResponse::from_fault(&fault, bad);
            assert_eq!(response.entity_id, UNKNOWN_ENTITY_ID);
        }
    }

    #[test]
    fn test_bounded_json_truncates_deterministically() {
        let fault = Fault::new("rejected", Some("y".repeat(3 * MAX_RESPONSE_BYTES)));
        let response = ErrorResponse::from_fault(&fault, Some("ns:thing"));
        let first = response.to_bounded_json();
        let second = response.to_bounded_json();
        assert_eq!(first, second);
        assert!(first.len() <= MAX_RESPONSE_BYTES);
        assert!(first.contains(TRUNCATION_MARKER));

        let decoded: ErrorResponse = serde_json::from_str(&first).unwrap();
        assert_eq!(decoded.entity_id, "ns:thing");
        assert!(decoded.message.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_bounded_json_truncates_on_char_boundary() {
        // Multi-byte message content must not be split mid-character.
        let fault = Fault::new("rejected", Some("\u{00e9}".repeat(2 * MAX_RESPONSE_BYTES)));
        let response = ErrorResponse::from_fault(&fault, None);
        let encoded = response.to_bounded_json();
        assert!(encoded.len() <= MAX_RESPONSE_BYTES);
        let decoded: Result<ErrorResponse, _> = serde_json::from_str(&encoded);
        assert!(decoded.is_ok());
    }

    #[test]
    fn test_error_signal_topic_scoped_to_entity() {
        let fault = Fault::new("timeout", Some("command timed out".into()));
        let signal = ErrorResponse::from_fault(&fault, Some("ns:thing")).into_signal();
        assert_eq!(signal.topic, "_errors/ns:thing");
        assert_eq!(signal.header("error-code"), Some("connectivity:timeout"));
    }
}
