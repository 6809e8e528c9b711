//! Builtin mapper implementations.
//!
//! The default conversion between wire payload and canonical signal is
//! shared by every builtin through [`convert_inbound`]/[`convert_outbound`];
//! the variants differ only in how often (or whether) they apply it.

use std::collections::HashMap;

use crate::mapping::{MapperFlags, MappingContext, MappingError, MessageMapper};
use crate::signal::{Adaptable, ExternalMessage};

const DEFAULT_INBOUND_TOPIC: &str = "signals/inbound";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default wire-to-canonical conversion.
///
/// The topic is taken from the message's `topic` header, falling back to
/// the instance's `topic` option, then to a fixed default. Headers are
/// copied verbatim; the payload is carried as UTF-8 text when it is valid
/// UTF-8 and dropped otherwise.
pub fn convert_inbound(message: &ExternalMessage, topic_option: Option<&str>) -> Adaptable {
    let topic = message
        .header("topic")
        .or(topic_option)
        .unwrap_or(DEFAULT_INBOUND_TOPIC)
        .to_string();
    Adaptable {
        topic,
        headers: message.headers.clone(),
        payload: message.payload_text().map(str::to_string),
    }
}

/// Default canonical-to-wire conversion, mirroring [`convert_inbound`].
pub fn convert_outbound(signal: &Adaptable, content_type_option: Option<&str>) -> ExternalMessage {
    let mut headers = signal.headers.clone();
    headers.insert("topic".into(), signal.topic.clone());
    ExternalMessage {
        headers,
        payload: signal.payload_bytes(),
        content_type: Some(
            content_type_option
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Pass-through
// ---------------------------------------------------------------------------

/// Maps every message 1:1 using the default conversion.
#[derive(Debug)]
pub struct PassThroughMapper {
    topic: Option<String>,
    content_type: Option<String>,
}

impl PassThroughMapper {
    pub fn from_context(context: &MappingContext) -> Self {
        Self {
            topic: context.option("topic").map(str::to_string),
            content_type: context.option("content-type").map(str::to_string),
        }
    }
}

impl MessageMapper for PassThroughMapper {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError> {
        Ok(vec![convert_inbound(message, self.topic.as_deref())])
    }

    fn map_outbound(&self, signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError> {
        Ok(vec![convert_outbound(signal, self.content_type.as_deref())])
    }
}

// ---------------------------------------------------------------------------
// Duplicating
// ---------------------------------------------------------------------------

/// Fans one message out into `count` identical canonical signals.
///
/// Each copy equals the single result of the pass-through conversion, so a
/// pipeline of one duplicating mapper with `count = n` behaves exactly like
/// `n` pass-through invocations on the same source.
#[derive(Debug)]
pub struct DuplicatingMapper {
    count: usize,
    topic: Option<String>,
    content_type: Option<String>,
}

impl DuplicatingMapper {
    pub fn from_context(context: &MappingContext) -> Result<Self, MappingError> {
        let count = match context.option("count") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                MappingError::config(context.alias(), format!("invalid count {raw:?}"))
            })?,
            None => 2,
        };
        if count == 0 {
            return Err(MappingError::config(context.alias(), "count must be >= 1"));
        }
        Ok(Self {
            count,
            topic: context.option("topic").map(str::to_string),
            content_type: context.option("content-type").map(str::to_string),
        })
    }
}

impl MessageMapper for DuplicatingMapper {
    fn name(&self) -> &'static str {
        "duplicating"
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError> {
        let signal = convert_inbound(message, self.topic.as_deref());
        Ok(vec![signal; self.count])
    }

    fn map_outbound(&self, signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError> {
        let message = convert_outbound(signal, self.content_type.as_deref());
        Ok(vec![message; self.count])
    }
}

// ---------------------------------------------------------------------------
// Dropping
// ---------------------------------------------------------------------------

/// Swallows every message: fan-in-to-empty.
#[derive(Debug)]
pub struct DroppingMapper;

impl MessageMapper for DroppingMapper {
    fn name(&self) -> &'static str {
        "dropping"
    }

    fn map_inbound(&self, _message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError> {
        Ok(Vec::new())
    }

    fn map_outbound(&self, _signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Faulty
// ---------------------------------------------------------------------------

/// Fails on every message with a configurable diagnostic.
///
/// Exists for fault-isolation testing and for deliberately poisoning a
/// pipeline slot during integration rehearsals.
#[derive(Debug)]
pub struct FaultyMapper {
    diagnostic: String,
}

impl FaultyMapper {
    pub fn from_context(context: &MappingContext) -> Self {
        Self {
            diagnostic: context
                .option("message")
                .unwrap_or("synthetic mapping failure")
                .to_string(),
        }
    }
}

impl MessageMapper for FaultyMapper {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn map_inbound(&self, _message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError> {
        Err(MappingError::mapper(self.diagnostic.clone()))
    }

    fn map_outbound(&self, _signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError> {
        Err(MappingError::mapper(self.diagnostic.clone()))
    }
}

// ---------------------------------------------------------------------------
// Header normalization
// ---------------------------------------------------------------------------

/// Pass-through conversion that first lowercases the configured header keys.
///
/// The `headers` option is a comma-separated list of keys to normalize;
/// with no option every header key is normalized.
#[derive(Debug)]
pub struct HeaderNormalizingMapper {
    keys: Option<Vec<String>>,
    topic: Option<String>,
    content_type: Option<String>,
}

impl HeaderNormalizingMapper {
    pub fn from_context(context: &MappingContext) -> Self {
        let keys = context.option("headers").map(|raw| {
            raw.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        });
        Self {
            keys,
            topic: context.option("topic").map(str::to_string),
            content_type: context.option("content-type").map(str::to_string),
        }
    }

    fn normalize(&self, headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let normalize = match &self.keys {
                    Some(keys) => keys.iter().any(|k| k.eq_ignore_ascii_case(key)),
                    None => true,
                };
                let key = if normalize {
                    key.to_ascii_lowercase()
                } else {
                    key.clone()
                };
                (key, value.clone())
            })
            .collect()
    }
}

impl MessageMapper for HeaderNormalizingMapper {
    fn name(&self) -> &'static str {
        "normalize-headers"
    }

    fn flags(&self) -> MapperFlags {
        MapperFlags::INBOUND
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError> {
        let normalized = ExternalMessage {
            headers: self.normalize(&message.headers),
            payload: message.payload.clone(),
            content_type: message.content_type.clone(),
        };
        Ok(vec![convert_inbound(&normalized, self.topic.as_deref())])
    }

    fn map_outbound(&self, signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError> {
        Ok(vec![convert_outbound(signal, self.content_type.as_deref())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MapperSpec;

    fn context(spec: MapperSpec) -> MappingContext {
        MappingContext::from_spec(&spec).unwrap()
    }

    #[test]
    fn test_pass_through_topic_resolution() {
        let ctx = context(MapperSpec::new("passthrough").with_option("topic", "fallback/topic"));
        let mapper = PassThroughMapper::from_context(&ctx);

        let with_header = ExternalMessage::text("x").with_header("topic", "from/header");
        let out = mapper.map_inbound(&with_header).unwrap();
        assert_eq!(out[0].topic, "from/header");

        let without_header = ExternalMessage::text("x");
        let out = mapper.map_inbound(&without_header).unwrap();
        assert_eq!(out[0].topic, "fallback/topic");
    }

    #[test]
    fn test_duplicating_count_parsing() {
        let ctx = context(MapperSpec::new("duplicating").with_option("count", "3"));
        let mapper = DuplicatingMapper::from_context(&ctx).unwrap();
        let out = mapper
            .map_inbound(&ExternalMessage::text("payload"))
            .unwrap();
        assert_eq!(out.len(), 3);

        let bad = context(MapperSpec::new("duplicating").with_option("count", "zero"));
        assert!(DuplicatingMapper::from_context(&bad).is_err());
        let zero = context(MapperSpec::new("duplicating").with_option("count", "0"));
        assert!(DuplicatingMapper::from_context(&zero).is_err());
    }

    #[test]
    fn test_dropping_yields_empty() {
        let mapper = DroppingMapper;
        assert!(mapper
            .map_inbound(&ExternalMessage::text("x"))
            .unwrap()
            .is_empty());
        assert!(mapper
            .map_outbound(&Adaptable::new("t"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_faulty_reports_configured_diagnostic() {
        let ctx = context(MapperSpec::new("faulty").with_option("message", "bad payload shape"));
        let mapper = FaultyMapper::from_context(&ctx);
        let err = mapper.map_inbound(&ExternalMessage::text("x")).unwrap_err();
        assert_eq!(err, MappingError::mapper("bad payload shape"));
    }

    #[test]
    fn test_header_normalization_selected_keys() {
        let ctx = context(MapperSpec::new("normalize-headers").with_option("headers", "Device-Id"));
        let mapper = HeaderNormalizingMapper::from_context(&ctx);
        let message = ExternalMessage::text("x")
            .with_header("Device-Id", "d1")
            .with_header("KeepCase", "v");
        let out = mapper.map_inbound(&message).unwrap();
        assert_eq!(out[0].header("device-id"), Some("d1"));
        assert_eq!(out[0].header("KeepCase"), Some("v"));
    }

    #[test]
    fn test_outbound_conversion_carries_topic_header() {
        let ctx = context(MapperSpec::new("passthrough").with_option("content-type", "text/plain"));
        let mapper = PassThroughMapper::from_context(&ctx);
        let signal = Adaptable::new("events/e1").with_payload("hello");
        let out = mapper.map_outbound(&signal).unwrap();
        assert_eq!(out[0].header("topic"), Some("events/e1"));
        assert_eq!(out[0].content_type(), Some("text/plain"));
        assert_eq!(out[0].payload_text(), Some("hello"));
    }
}
