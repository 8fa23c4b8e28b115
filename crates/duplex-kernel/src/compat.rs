//! Compatibility policy engine.
//!
//! Decides what to do with an inbound payload given the contract version it
//! declares and the major versions this deployment serves:
//!
//! | Situation | Decision |
//! |-----------|----------|
//! | declared major not served | `Reject("unsupported major version")` |
//! | declared ≤ newest served version | `Accept` |
//! | declared > newest served version | `Accept` (forward-tolerant, flagged) |
//! | absent fields filled from schema defaults | `AcceptWithDefaults` |
//! | required fields absent, no default | `Reject` |
//!
//! Payloads are always normalized to the *newest* schema of the declared
//! major that can parse them. When several schema versions of the major
//! could parse the payload, the highest one whose hard-required field set
//! is a subset of the present fields wins.

use crate::contract::{
    ContractError, ContractRegistry, ContractVersion, ParsedArtifact, parse_object,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

// ─────────────────────────────────────────────────────────────────────────────
// Decision types
// ─────────────────────────────────────────────────────────────────────────────

/// Stable, machine-readable rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    UnsupportedMajorVersion,
    InvalidVersion,
    UnknownContract,
    UnknownVersion,
    ValidationFailed,
    MalformedPayload,
    TypeMismatch,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::UnsupportedMajorVersion => "UNSUPPORTED_MAJOR_VERSION",
            ReasonCode::InvalidVersion => "INVALID_VERSION",
            ReasonCode::UnknownContract => "UNKNOWN_CONTRACT",
            ReasonCode::UnknownVersion => "UNKNOWN_VERSION",
            ReasonCode::ValidationFailed => "VALIDATION_FAILED",
            ReasonCode::MalformedPayload => "MALFORMED_PAYLOAD",
            ReasonCode::TypeMismatch => "TYPE_MISMATCH",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an artifact was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectReason {
    pub code: ReasonCode,
    pub message: String,
    /// Populated for [`ReasonCode::ValidationFailed`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    /// Populated for [`ReasonCode::UnsupportedMajorVersion`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_majors: Vec<u64>,
}

impl RejectReason {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            missing_fields: Vec::new(),
            supported_majors: Vec::new(),
        }
    }

    fn unsupported_major(supported: &BTreeSet<u64>) -> Self {
        Self {
            supported_majors: supported.iter().copied().collect(),
            ..Self::new(ReasonCode::UnsupportedMajorVersion, "unsupported major version")
        }
    }

    fn missing(missing_fields: Vec<String>) -> Self {
        Self {
            message: format!("missing required fields: {}", missing_fields.join(", ")),
            missing_fields,
            ..Self::new(ReasonCode::ValidationFailed, "")
        }
    }

    fn from_contract_error(err: ContractError) -> Self {
        match err {
            ContractError::Validation { missing_fields } => Self::missing(missing_fields),
            ContractError::Malformed(msg) => Self::new(ReasonCode::MalformedPayload, msg),
            e @ ContractError::TypeMismatch { .. } => {
                Self::new(ReasonCode::TypeMismatch, e.to_string())
            }
            e @ ContractError::UnknownContract(_) => {
                Self::new(ReasonCode::UnknownContract, e.to_string())
            }
            e => Self::new(ReasonCode::UnknownVersion, e.to_string()),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// An accepted payload, normalized to the schema version the service uses.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArtifact {
    /// Version the caller declared (or the inferred oldest supported one).
    pub declared: ContractVersion,
    /// Whether `declared` is newer than anything this deployment knows.
    pub forward_compatible: bool,
    pub artifact: ParsedArtifact,
}

impl NormalizedArtifact {
    /// Version of the schema the payload was normalized to.
    pub fn served(&self) -> ContractVersion {
        self.artifact.version
    }
}

/// Outcome of [`CompatibilityPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompatibilityDecision {
    Accept(NormalizedArtifact),
    AcceptWithDefaults(NormalizedArtifact, Vec<String>),
    Reject(RejectReason),
}

impl CompatibilityDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, CompatibilityDecision::Reject(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Accept/default/reject policy over the set of served major versions.
#[derive(Debug, Clone)]
pub struct CompatibilityPolicy {
    supported_majors: BTreeSet<u64>,
}

impl CompatibilityPolicy {
    pub fn new(supported_majors: impl IntoIterator<Item = u64>) -> Self {
        Self {
            supported_majors: supported_majors.into_iter().collect(),
        }
    }

    pub fn supported_majors(&self) -> &BTreeSet<u64> {
        &self.supported_majors
    }

    pub fn supports(&self, major: u64) -> bool {
        self.supported_majors.contains(&major)
    }

    /// Version assumed when an artifact declares none: the oldest registered
    /// version of the contract under a served major.
    pub fn infer_version(
        &self,
        registry: &ContractRegistry,
        contract: &str,
    ) -> Option<ContractVersion> {
        registry.oldest_matching(contract, |major| self.supports(major))
    }

    /// Decide what to do with `raw`, declared as `contract` at `declared`.
    pub fn evaluate(
        &self,
        registry: &ContractRegistry,
        contract: &str,
        declared: Option<ContractVersion>,
        raw: &[u8],
    ) -> CompatibilityDecision {
        let declared = match declared {
            Some(v) => v,
            None => match self.infer_version(registry, contract) {
                Some(v) => v,
                None if !registry.contains(contract) => {
                    return CompatibilityDecision::Reject(RejectReason::from_contract_error(
                        ContractError::UnknownContract(contract.to_string()),
                    ));
                }
                None => {
                    return CompatibilityDecision::Reject(RejectReason::unsupported_major(
                        &self.supported_majors,
                    ));
                }
            },
        };

        if !self.supports(declared.major) {
            return CompatibilityDecision::Reject(RejectReason::unsupported_major(
                &self.supported_majors,
            ));
        }

        let candidates = registry.schemas_in_major(contract, declared.major);
        let Some(newest) = candidates.last() else {
            let err = if registry.contains(contract) {
                ContractError::UnknownVersion {
                    name: contract.to_string(),
                    version: declared,
                }
            } else {
                ContractError::UnknownContract(contract.to_string())
            };
            return CompatibilityDecision::Reject(RejectReason::from_contract_error(err));
        };

        let forward_compatible = declared > newest.version;
        if forward_compatible {
            info!(
                contract,
                declared = %declared,
                served = %newest.version,
                "accepting artifact from a newer contract version"
            );
        }

        let object = match parse_object(raw) {
            Ok(object) => object,
            Err(e) => return CompatibilityDecision::Reject(RejectReason::from_contract_error(e)),
        };

        let present: BTreeSet<&str> = object
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
            .collect();

        // Most specific match wins: highest version whose hard-required
        // fields are all present.
        let Some(chosen) = candidates
            .iter()
            .rev()
            .find(|schema| schema.hard_required_fields().is_subset(&present))
        else {
            let missing = newest
                .hard_required_fields()
                .difference(&present)
                .map(|f| (*f).to_string())
                .collect();
            return CompatibilityDecision::Reject(RejectReason::missing(missing));
        };

        match registry.validate_object(chosen, object) {
            Ok(validation) => {
                let normalized = NormalizedArtifact {
                    declared,
                    forward_compatible,
                    artifact: validation.artifact,
                };
                if validation.applied_defaults.is_empty() {
                    CompatibilityDecision::Accept(normalized)
                } else {
                    CompatibilityDecision::AcceptWithDefaults(
                        normalized,
                        validation.applied_defaults,
                    )
                }
            }
            Err(e) => CompatibilityDecision::Reject(RejectReason::from_contract_error(e)),
        }
    }
}
