//! Connection configuration types.
//!
//! Descriptors are owned by the configuration collaborator and passed by
//! value into worker creation; they are never mutated after construction.
//! A descriptor change always rebuilds the worker's mapping pipeline from
//! scratch so partially-applied configuration cannot be observed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::mapping::registry::MapperRegistry;

const MAX_CONNECTION_ID_BYTES: usize = 256;

// ---------------------------------------------------------------------------
// Connection identity
// ---------------------------------------------------------------------------

/// Stable identifier of one logical external connection.
///
/// Used as the sharding key: at most one live worker exists per id at any
/// instant. Ids are validated on construction and on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Parse and validate an identifier.
    ///
    /// Valid ids are non-empty, at most 256 bytes, and restricted to
    /// ASCII alphanumerics plus `.`, `_`, `:`, and `-`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidConnectionId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidConnectionId::Empty);
        }
        if raw.len() > MAX_CONNECTION_ID_BYTES {
            return Err(InvalidConnectionId::TooLong(raw.len()));
        }
        let bad = raw
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | ':' | '-'));
        if bad {
            return Err(InvalidConnectionId::InvalidCharacters);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = InvalidConnectionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Why an identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidConnectionId {
    #[error("connection id is empty")]
    Empty,
    #[error("connection id exceeds {MAX_CONNECTION_ID_BYTES} bytes: {0}")]
    TooLong(usize),
    #[error("connection id contains invalid characters")]
    InvalidCharacters,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Lifecycle flag of a connection definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Deleted,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::Active
    }
}

/// Immutable configuration for one logical broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: ConnectionId,
    /// Target endpoint URI (scheme and authority are opaque to this crate).
    pub uri: String,
    /// Protocol-specific settings forwarded verbatim to the transport.
    #[serde(default)]
    pub settings: HashMap<String, String>,
    /// Ordered mapper instances applied to every message on this connection.
    #[serde(default)]
    pub mappers: Vec<MapperSpec>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl ConnectionDescriptor {
    pub fn new(id: ConnectionId, uri: impl Into<String>) -> Self {
        Self {
            id,
            uri: uri.into(),
            settings: HashMap::new(),
            mappers: Vec::new(),
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn with_mapper(mut self, spec: MapperSpec) -> Self {
        self.mappers.push(spec);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Validate the descriptor against a mapper registry.
    ///
    /// Unknown aliases and malformed conditions are configuration errors
    /// surfaced here, at load time, never at message time.
    pub fn validate(&self, registry: &MapperRegistry) -> Result<()> {
        if self.uri.trim().is_empty() {
            bail!("connection {}: target uri is empty", self.id);
        }
        for spec in &self.mappers {
            if !registry.contains(&spec.alias) {
                bail!(
                    "connection {}: unknown mapper alias {:?}",
                    self.id,
                    spec.alias
                );
            }
            spec.validate()
                .with_context(|| format!("connection {}: mapper {:?}", self.id, spec.alias))?;
        }
        Ok(())
    }
}

/// One configured mapper instance inside a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapperSpec {
    /// Registry alias selecting the mapper implementation.
    pub alias: String,
    /// Ordered property bag interpreted by the mapper implementation.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Applicability conditions evaluated against inbound message headers.
    #[serde(default)]
    pub inbound_conditions: Vec<ConditionSpec>,
    /// Applicability conditions evaluated against outbound signal headers.
    #[serde(default)]
    pub outbound_conditions: Vec<ConditionSpec>,
    /// Content types this mapper instance skips without error.
    #[serde(default)]
    pub content_type_blocklist: Vec<String>,
}

impl MapperSpec {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_inbound_condition(mut self, condition: ConditionSpec) -> Self {
        self.inbound_conditions.push(condition);
        self
    }

    pub fn with_outbound_condition(mut self, condition: ConditionSpec) -> Self {
        self.outbound_conditions.push(condition);
        self
    }

    pub fn with_blocked_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type_blocklist.push(content_type.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.alias.trim().is_empty() {
            bail!("mapper alias is empty");
        }
        for condition in self
            .inbound_conditions
            .iter()
            .chain(self.outbound_conditions.iter())
        {
            condition.validate()?;
        }
        Ok(())
    }
}

/// Serializable form of a header applicability condition.
///
/// Compiled into an executable condition when the mapping pipeline is built;
/// regex compilation failures are descriptor-load errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub header: String,
    pub operator: OperatorSpec,
    #[serde(default)]
    pub value: Option<String>,
}

impl ConditionSpec {
    pub fn eq(header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operator: OperatorSpec::Eq,
            value: Some(value.into()),
        }
    }

    pub fn ne(header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operator: OperatorSpec::Ne,
            value: Some(value.into()),
        }
    }

    pub fn exists(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operator: OperatorSpec::Exists,
            value: None,
        }
    }

    pub fn absent(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operator: OperatorSpec::Absent,
            value: None,
        }
    }

    pub fn matches(header: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            operator: OperatorSpec::Matches,
            value: Some(pattern.into()),
        }
    }

    fn validate(&self) -> Result<()> {
        match self.operator {
            OperatorSpec::Eq | OperatorSpec::Ne => {
                if self.value.is_none() {
                    bail!("condition on {:?} requires a value", self.header);
                }
            }
            OperatorSpec::Exists | OperatorSpec::Absent => {}
            OperatorSpec::Matches => {
                let pattern = self
                    .value
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("regex condition requires a pattern"))?;
                regex::Regex::new(pattern)
                    .with_context(|| format!("invalid condition pattern {pattern:?}"))?;
            }
        }
        Ok(())
    }
}

/// Comparison operator of a header condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorSpec {
    Eq,
    Ne,
    Exists,
    Absent,
    Matches,
}

// ---------------------------------------------------------------------------
// Restart and timeout policies
// ---------------------------------------------------------------------------

/// Backoff schedule for worker restarts.
///
/// The delay doubles per consecutive failure from `base_delay_ms` up to
/// `max_delay_ms`. A `ceiling` of `None` retries indefinitely; `Some(n)`
/// escalates after `n` consecutive failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub ceiling: Option<u32>,
    /// Randomize each delay by +/-25% to avoid reconnection storms when
    /// many connections fail at once.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl RestartPolicy {
    /// Policy for the initialization phase: bounded retries, then escalate.
    pub fn initialization() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            ceiling: Some(5),
            jitter: true,
        }
    }

    /// Policy for steady-state transport loss: retry indefinitely with a
    /// capped delay. Steady-state crashes are assumed transient.
    pub fn steady_state() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            ceiling: None,
            jitter: true,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Independent deadlines for the worker lifecycle phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTimeouts {
    /// Deadline for one transport-open attempt.
    pub init_deadline_ms: u64,
    /// Grace period for draining in-flight sends during close.
    pub close_grace_ms: u64,
    /// How long a routing caller waits for a worker to finish initializing.
    pub creation_wait_ms: u64,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            init_deadline_ms: 10_000,
            close_grace_ms: 5_000,
            creation_wait_ms: 30_000,
        }
    }
}

impl WorkerTimeouts {
    pub fn init_deadline(&self) -> Duration {
        Duration::from_millis(self.init_deadline_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn creation_wait(&self) -> Duration {
        Duration::from_millis(self.creation_wait_ms)
    }
}

/// Router-level tuning. The per-worker mailbox bound lives on the
/// supervisor, which owns channel creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Workers idle past this threshold are eligible for eviction.
    pub max_idle_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_idle_ms: 300_000,
        }
    }
}

impl RouterConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_validation() {
        assert!(ConnectionId::parse("bridge-7.west:amqp").is_ok());
        assert_eq!(ConnectionId::parse(""), Err(InvalidConnectionId::Empty));
        assert_eq!(
            ConnectionId::parse("has spaces"),
            Err(InvalidConnectionId::InvalidCharacters)
        );
        let long = "x".repeat(MAX_CONNECTION_ID_BYTES + 1);
        assert!(matches!(
            ConnectionId::parse(long),
            Err(InvalidConnectionId::TooLong(_))
        ));
    }

    #[test]
    fn test_connection_id_serde_rejects_invalid() {
        let ok: Result<ConnectionId, _> = serde_json::from_str("\"conn-1\"");
        assert!(ok.is_ok());
        let bad: Result<ConnectionId, _> = serde_json::from_str("\"bad id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        let registry = MapperRegistry::with_builtins();
        let id = ConnectionId::parse("conn-1").unwrap();

        let ok = ConnectionDescriptor::new(id.clone(), "amqp://broker.local:5672")
            .with_mapper(MapperSpec::new("passthrough"));
        assert!(ok.validate(&registry).is_ok());

        let unknown_alias = ConnectionDescriptor::new(id.clone(), "amqp://broker.local:5672")
            .with_mapper(MapperSpec::new("no-such-mapper"));
        assert!(unknown_alias.validate(&registry).is_err());

        let empty_uri = ConnectionDescriptor::new(id, "  ");
        assert!(empty_uri.validate(&registry).is_err());
    }

    #[test]
    fn test_condition_pattern_checked_at_load_time() {
        let registry = MapperRegistry::with_builtins();
        let id = ConnectionId::parse("conn-1").unwrap();
        let descriptor = ConnectionDescriptor::new(id, "mqtt://broker").with_mapper(
            MapperSpec::new("passthrough")
                .with_inbound_condition(ConditionSpec::matches("device", "[unclosed")),
        );
        assert!(descriptor.validate(&registry).is_err());
    }

    #[test]
    fn test_restart_policy_defaults() {
        let init = RestartPolicy::initialization();
        assert_eq!(init.ceiling, Some(5));
        let steady = RestartPolicy::steady_state();
        assert_eq!(steady.ceiling, None);
        assert!(steady.max_delay() >= steady.base_delay());
    }

    #[test]
    fn test_descriptor_serde_round_trip() {
        let id = ConnectionId::parse("conn-rt").unwrap();
        let descriptor = ConnectionDescriptor::new(id, "kafka://cluster:9092")
            .with_setting("client.id", "tether")
            .with_mapper(
                MapperSpec::new("duplicating")
                    .with_option("count", "3")
                    .with_inbound_condition(ConditionSpec::exists("device"))
                    .with_blocked_content_type("application/octet-stream"),
            );
        let encoded = serde_json::to_string(&descriptor).unwrap();
        let decoded: ConnectionDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, descriptor);
    }
}
