//! Bidirectional message mapping between wire payloads and canonical signals.
//!
//! A connection's pipeline is an ordered set of independently-configured
//! mapper instances. Mapping is synchronous and must never block on I/O;
//! the worker invokes the pipeline inline on its own task.

pub mod builtin;
pub mod context;
pub mod pipeline;
pub mod registry;

use bitflags::bitflags;

use crate::signal::{Adaptable, ExternalMessage};
pub use context::MappingContext;
pub use pipeline::{MappingPipeline, PipelineOutput};
pub use registry::MapperRegistry;

bitflags! {
    /// Directions a mapper implementation supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapperFlags: u32 {
        const INBOUND = 0b01;
        const OUTBOUND = 0b10;
    }
}

impl MapperFlags {
    pub fn bidirectional() -> Self {
        Self::INBOUND | Self::OUTBOUND
    }
}

/// A pluggable transformer between wire payload and canonical signal.
///
/// Implementations are constructed by a [`registry::MapperFactory`] from a
/// [`MappingContext`] and are immutable afterwards. Either direction may
/// return zero, one, or many results: fan-out and fan-in-to-empty are both
/// legitimate. Returning an error never aborts the pipeline; the failure is
/// isolated per mapper.
pub trait MessageMapper: std::fmt::Debug + Send + Sync {
    /// Implementation name (not the configured instance alias).
    fn name(&self) -> &'static str;

    fn flags(&self) -> MapperFlags {
        MapperFlags::bidirectional()
    }

    /// Content types this implementation never handles; messages matching
    /// are skipped for this mapper without error. Merged with the
    /// instance-level blocklist from configuration.
    fn content_type_blocklist(&self) -> &[&str] {
        &[]
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, MappingError>;

    fn map_outbound(&self, signal: &Adaptable) -> Result<Vec<ExternalMessage>, MappingError>;
}

/// Mapping and pipeline-construction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// No factory is registered under the requested alias. Raised when the
    /// pipeline is built from a descriptor, never at message time.
    #[error("unknown mapper alias {alias:?}")]
    UnknownAlias { alias: String },

    /// The mapper rejected its configuration.
    #[error("mapper {alias:?} misconfigured: {reason}")]
    Config { alias: String, reason: String },

    /// The mapper failed while transforming a message.
    #[error("mapping failed: {reason}")]
    Mapper { reason: String },
}

impl MappingError {
    pub fn mapper(reason: impl Into<String>) -> Self {
        Self::Mapper {
            reason: reason.into(),
        }
    }

    pub fn config(alias: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            alias: alias.into(),
            reason: reason.into(),
        }
    }
}
