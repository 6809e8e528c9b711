//! Per-mapper configuration context and applicability conditions.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::core::config::{ConditionSpec, MapperSpec, OperatorSpec};
use crate::mapping::MappingError;

/// Immutable configuration attached 1:1 to a configured mapper instance.
///
/// Built once when the pipeline is assembled; condition patterns are
/// compiled here so message-time evaluation is allocation-free.
#[derive(Debug)]
pub struct MappingContext {
    alias: String,
    options: BTreeMap<String, String>,
    inbound: Vec<Condition>,
    outbound: Vec<Condition>,
    content_type_blocklist: Vec<String>,
}

impl MappingContext {
    pub fn from_spec(spec: &MapperSpec) -> Result<Self, MappingError> {
        let compile = |specs: &[ConditionSpec]| -> Result<Vec<Condition>, MappingError> {
            specs.iter().map(Condition::compile).collect()
        };
        Ok(Self {
            alias: spec.alias.clone(),
            options: spec.options.clone(),
            inbound: compile(&spec.inbound_conditions)?,
            outbound: compile(&spec.outbound_conditions)?,
            content_type_blocklist: spec.content_type_blocklist.clone(),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// All inbound conditions must hold for the mapper to be invoked.
    pub fn applies_inbound(&self, headers: &HashMap<String, String>) -> bool {
        self.inbound.iter().all(|c| c.matches(headers))
    }

    /// All outbound conditions must hold for the mapper to be invoked.
    pub fn applies_outbound(&self, headers: &HashMap<String, String>) -> bool {
        self.outbound.iter().all(|c| c.matches(headers))
    }

    /// Whether the given content type is filtered out for this instance.
    pub fn blocks_content_type(&self, content_type: Option<&str>) -> bool {
        match content_type {
            Some(ct) => self
                .content_type_blocklist
                .iter()
                .any(|blocked| blocked.eq_ignore_ascii_case(ct)),
            None => false,
        }
    }
}

/// Compiled header condition.
#[derive(Debug)]
struct Condition {
    header: String,
    operator: Operator,
}

#[derive(Debug)]
enum Operator {
    Eq(String),
    Ne(String),
    Exists,
    Absent,
    Matches(Regex),
}

impl Condition {
    fn compile(spec: &ConditionSpec) -> Result<Self, MappingError> {
        let value = || {
            spec.value.clone().ok_or_else(|| MappingError::Config {
                alias: String::new(),
                reason: format!("condition on {:?} requires a value", spec.header),
            })
        };
        let operator = match spec.operator {
            OperatorSpec::Eq => Operator::Eq(value()?),
            OperatorSpec::Ne => Operator::Ne(value()?),
            OperatorSpec::Exists => Operator::Exists,
            OperatorSpec::Absent => Operator::Absent,
            OperatorSpec::Matches => {
                let pattern = value()?;
                let regex = Regex::new(&pattern).map_err(|err| MappingError::Config {
                    alias: String::new(),
                    reason: format!("invalid condition pattern {pattern:?}: {err}"),
                })?;
                Operator::Matches(regex)
            }
        };
        Ok(Self {
            header: spec.header.clone(),
            operator,
        })
    }

    fn matches(&self, headers: &HashMap<String, String>) -> bool {
        let value = headers.get(&self.header).map(String::as_str);
        match (&self.operator, value) {
            (Operator::Exists, found) => found.is_some(),
            (Operator::Absent, found) => found.is_none(),
            (Operator::Eq(expected), Some(found)) => expected == found,
            (Operator::Ne(expected), Some(found)) => expected != found,
            (Operator::Ne(_), None) => true,
            (Operator::Matches(regex), Some(found)) => regex.is_match(found),
            (_, None) => false,
        }
    }
}
