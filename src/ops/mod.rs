//! Operational visibility: status events and transition counters.

pub mod observability;

pub use observability::{ConnectionEvents, ConnectionStatus, TransitionSnapshot};
