//! The ordered mapping pipeline of one connection.

use tracing::debug;

use crate::core::config::MapperSpec;
use crate::mapping::{MapperFlags, MapperRegistry, MappingContext, MappingError, MessageMapper};
use crate::signal::{Adaptable, ExternalMessage, MappingFailure};

/// Result of running a pipeline over one message.
///
/// `signals` concatenates the outputs of every applicable mapper in
/// configured order; `failures` isolates mappers that raised an error.
/// Both empty means no mapper applied, which is a legitimate drop.
#[derive(Debug, Default)]
pub struct PipelineOutput<T> {
    pub signals: Vec<T>,
    pub failures: Vec<MappingFailure>,
}

impl<T> PipelineOutput<T> {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug)]
struct PipelineEntry {
    mapper: Box<dyn MessageMapper>,
    context: MappingContext,
}

/// Instance-level blocklist from configuration, or the implementation's
/// own declared blocklist.
fn blocked(entry: &PipelineEntry, content_type: Option<&str>) -> bool {
    if entry.context.blocks_content_type(content_type) {
        return true;
    }
    match content_type {
        Some(ct) => entry
            .mapper
            .content_type_blocklist()
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(ct)),
        None => false,
    }
}

/// Ordered set of configured mapper instances.
///
/// Pipelines are immutable; a descriptor change rebuilds the pipeline from
/// the registry rather than mutating it in place.
#[derive(Default, Debug)]
pub struct MappingPipeline {
    entries: Vec<PipelineEntry>,
}

impl MappingPipeline {
    /// Build a pipeline from the descriptor's mapper specifications.
    ///
    /// Fails fast on unknown aliases or rejected configuration.
    pub fn build(specs: &[MapperSpec], registry: &MapperRegistry) -> Result<Self, MappingError> {
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let context = MappingContext::from_spec(spec)?;
            let mapper = registry.create(&spec.alias, &context)?;
            entries.push(PipelineEntry { mapper, context });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every applicable mapper to one inbound wire message.
    ///
    /// Each mapper sees the same source message; a failing mapper is
    /// recorded and the pipeline continues with its peers.
    pub fn map_inbound(&self, message: &ExternalMessage) -> PipelineOutput<Adaptable> {
        let mut output = PipelineOutput::default();
        for entry in &self.entries {
            if !entry.mapper.flags().contains(MapperFlags::INBOUND) {
                continue;
            }
            if !entry.context.applies_inbound(&message.headers) {
                continue;
            }
            if blocked(entry, message.content_type()) {
                debug!(
                    mapper = entry.context.alias(),
                    content_type = ?message.content_type(),
                    "mapper skipped by content-type blocklist"
                );
                continue;
            }
            match entry.mapper.map_inbound(message) {
                Ok(signals) => output.signals.extend(signals),
                Err(err) => output.failures.push(MappingFailure {
                    mapper: entry.context.alias().to_string(),
                    content_type: message.content_type.clone(),
                    diagnostic: err.to_string(),
                }),
            }
        }
        output
    }

    /// Apply every applicable mapper to one outbound signal. Mirrors
    /// [`Self::map_inbound`] symmetrically.
    pub fn map_outbound(&self, signal: &Adaptable) -> PipelineOutput<ExternalMessage> {
        let mut output = PipelineOutput::default();
        for entry in &self.entries {
            if !entry.mapper.flags().contains(MapperFlags::OUTBOUND) {
                continue;
            }
            if !entry.context.applies_outbound(&signal.headers) {
                continue;
            }
            match entry.mapper.map_outbound(signal) {
                Ok(messages) => output.signals.extend(messages),
                Err(err) => output.failures.push(MappingFailure {
                    mapper: entry.context.alias().to_string(),
                    content_type: None,
                    diagnostic: err.to_string(),
                }),
            }
        }
        output
    }
}
