//! Versioned contract schemas.
//!
//! ```text
//! ContractVersion ──► SchemaDefinition ──► ContractRegistry
//!   (1, 1, 0)          name + fields         register / resolve / validate
//! ```
//!
//! Within one major version, schemas only evolve additively: fields are
//! never removed, a required field may relax to optional but never the
//! reverse, and new fields arrive optional or with a default. The registry
//! enforces this at registration time.

pub mod error;
pub mod registry;
pub mod schema;
pub mod version;

pub use error::ContractError;
pub use registry::{ContractRegistry, ParsedArtifact, UnknownFields, Validation, parse_object};
pub use schema::{FieldSpec, FieldType, SchemaDefinition};
pub use version::{ContractVersion, ParseVersionError};
