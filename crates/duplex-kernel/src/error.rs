//! Crate-level error types for `duplex-kernel`.
//!
//! Provides a unified [`KernelError`] that composes the typed errors of every
//! sub-module together with [`error_stack::Report`] for context-carrying
//! propagation on startup paths (schema loading, secret resolution).
//!
//! # Usage
//!
//! ```rust,ignore
//! use duplex_kernel::error::{KernelError, KernelResult};
//! use error_stack::ResultExt;
//!
//! fn load(registry: &ContractRegistry, schema: SchemaDefinition) -> KernelResult<()> {
//!     registry
//!         .register(schema)
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("registering orders.yaml")?;
//!     Ok(())
//! }
//! ```
//!
//! | Failure class | Type | Surfaced to |
//! |---------------|------|-------------|
//! | malformed/incomplete payload | [`ContractError`] | REST caller / dead-letter |
//! | out-of-scope access | [`AuthorizationError`] | REST caller / telemetry |
//! | unserved major version | `RejectReason` (`UNSUPPORTED_MAJOR_VERSION`) | REST caller / dead-letter |
//! | connection failure | [`TransportError`] | logs; retried by reconnect |
//! | double acknowledgment | [`DeliveryError::Duplicate`] | nobody |

use crate::artifact::InvalidTransition;
use crate::contract::ContractError;
use crate::delivery::DeliveryError;
use crate::dispatch::DispatchError;
use crate::scope::{AuthorizationError, InvalidPattern};
use crate::secrets::SecretsError;
use crate::transport::TransportError;
use thiserror::Error;

/// Crate-level error type for `duplex-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Scope pattern error: {0}")]
    Pattern(#[from] InvalidPattern),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] InvalidTransition),

    /// A configuration-related error (requires the `config` feature).
    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
