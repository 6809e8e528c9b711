//! Wire-level and canonical message representations.

pub mod adaptable;
pub mod external;

pub use adaptable::{Adaptable, MappingFailure};
pub use external::ExternalMessage;
