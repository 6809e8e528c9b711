#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: worker loops are inherently long
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in backoff and telemetry code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
// Passing style
#![allow(clippy::needless_pass_by_value)]

//! Tether - connectivity layer for distributed IoT/digital-twin platforms.
//!
//! Owns the lifecycle of external broker connections, converts between
//! wire-level payloads and the canonical internal protocol, and routes
//! inbound/outbound signals with acknowledgement and failure accounting.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Connection descriptors, restart policies, timeouts
//! - `core::time` - Deterministic time utilities
//!
//! ## Signals
//! - `signal::external` - Wire-level payloads
//! - `signal::adaptable` - Canonical signal representation
//!
//! ## Mapping
//! - `mapping::pipeline` - Ordered fan-out pipeline with fault isolation
//! - `mapping::registry` - Alias-to-mapper resolution
//! - `mapping::builtin` - Pass-through, duplicating, dropping, faulty,
//!   header-normalizing mappers
//!
//! ## Faults
//! - `faults::classifier` - User-indicated vs. system fault patterns
//! - `faults::response` - Bounded typed error responses
//!
//! ## Workers
//! - `worker` - Per-connection actor and state machine
//! - `worker::supervisor` - Restart-with-backoff supervision
//! - `worker::transport` - Transport collaborator seam
//!
//! ## Routing
//! - `routing::local` - Claim-map single-writer routing
//! - `routing::ring` - Consistent-hash cluster routing
//!
//! ## Dispatch
//! - `dispatch` - Outbound sends, outcomes, acknowledgements
//! - `dispatch::monitor` - Disposition monitors and counters
//!
//! ## Operations
//! - `ops::observability` - Status events and transition counters

// Core infrastructure
pub mod core;

// Message representations
pub mod signal;

// Mapping pipeline
pub mod mapping;

// Fault classification
pub mod faults;

// Workers & supervision
pub mod worker;

// Routing
pub mod routing;

// Outbound dispatch
pub mod dispatch;

// Operations
pub mod ops;

// Re-exports for convenience
pub use self::core::config::{
    ConnectionDescriptor, ConnectionId, MapperSpec, RestartPolicy, RouterConfig, WorkerTimeouts,
};
pub use self::core::time::{Clock, SystemClock};
pub use dispatch::{Outcome, OutboundDispatcher, SendingContext, TargetAddress};
pub use faults::{Fault, FaultClass, FaultClassifier, FaultPattern};
pub use mapping::{MapperRegistry, MappingPipeline, MessageMapper};
pub use ops::{ConnectionEvents, ConnectionStatus};
pub use routing::{
    DescriptorSource, EntityRouter, HashRing, HashRingRouter, InboundEnvelope, LocalEntityRouter,
    PeerForwarder, RoutingError,
};
pub use signal::{Adaptable, ExternalMessage};
pub use worker::transport::{Connection, SendReceipt, Transport, TransportError};
pub use worker::{
    ActorRef, CreationArgs, SignalProcessor, WorkerCommand, WorkerHandle, WorkerSupervisor,
};
