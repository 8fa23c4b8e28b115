//! Duplex kernel: the transport-independent core of a dual-channel gateway.
//!
//! ```text
//! InboundArtifact ─► scope (authorize) ─► contract (parse) ─► compat (decide)
//!                                                               │
//!                           delivery (pub/sub only) ◄───────────┤
//!                                                               ▼
//!                                                      dispatch (handler)
//! ```
//!
//! Nothing here opens a socket. The runtime crate wires these pieces to an
//! HTTP listener and a pub/sub transport.

// artifact and lifecycle module
pub mod artifact;

// versioned contracts
pub mod contract;

// compatibility policy
pub mod compat;

// credential scoping
pub mod scope;

// pub/sub delivery tracking
pub mod delivery;

// business dispatch
pub mod dispatch;

// external boundaries
pub mod secrets;
pub mod telemetry;
pub mod transport;

// configuration loader
#[cfg(feature = "config")]
pub mod config;

// error module
pub mod error;

pub use artifact::{
    ArtifactState, Channel, HttpMethod, InboundArtifact, Lifecycle, PubSubMessage, RestRequest,
};
pub use compat::{CompatibilityDecision, CompatibilityPolicy, NormalizedArtifact, ReasonCode, RejectReason};
pub use contract::{ContractRegistry, ContractVersion, FieldSpec, FieldType, SchemaDefinition};
pub use error::{KernelError, KernelResult};
pub use scope::{CallerIdentity, Resource, ScopeAuthorizer, ScopeGrant, ScopePattern};
pub use telemetry::{TelemetryEvent, TelemetrySink};
