//! Contract registry error types.

use super::schema::FieldType;
use super::version::ContractVersion;
use thiserror::Error;

/// Failures raised while registering, resolving or validating against
/// contract schemas.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContractError {
    // ── Registration ────────────────────────────────────────────────────────
    /// A schema with the same `(name, version)` pair is already registered.
    #[error("schema '{name}' version {version} is already registered")]
    DuplicateVersion {
        name: String,
        version: ContractVersion,
    },

    /// A schema breaks the evolution rules of its major version when compared
    /// with a neighbouring registered version.
    #[error("schema '{name}' version {version} is incompatible with {neighbour}: {reason}")]
    IncompatibleEvolution {
        name: String,
        version: ContractVersion,
        neighbour: ContractVersion,
        reason: String,
    },

    /// The schema name is empty or whitespace-only.
    #[error("schema name cannot be empty")]
    EmptyName,

    // ── Resolution ──────────────────────────────────────────────────────────
    /// No schema of this name has been registered.
    #[error("unknown contract '{0}'")]
    UnknownContract(String),

    /// The name is known but no exact or compatible version exists.
    #[error("no compatible version of '{name}' for {version}")]
    UnknownVersion {
        name: String,
        version: ContractVersion,
    },

    // ── Validation ──────────────────────────────────────────────────────────
    /// The payload is not parseable as a JSON object.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Required fields are absent and the schema defines no default for them.
    #[error("missing required fields: {}", missing_fields.join(", "))]
    Validation { missing_fields: Vec<String> },

    /// A present field has the wrong JSON type.
    #[error("field '{field}' must be of type {}, found {found}", expected.as_str())]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
}
