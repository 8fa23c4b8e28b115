//! Common admission pipeline shared by both channels.
//!
//! ```text
//! Received ─► Authenticating ─► Validating ─► Accepted ─► Dispatched
//!                   │                │
//!                   └──────┬─────────┘
//!                          ▼
//!                       Rejected
//! ```
//!
//! [`GatewayPipeline::admit`] walks an [`InboundArtifact`] from `Received`
//! to `Accepted` or `Rejected`, emitting telemetry at each decision.
//! [`GatewayPipeline::dispatch`] performs the final `Accepted → Dispatched`
//! step. The channel front-ends decide what a rejection means for the caller.

use crate::auth::CredentialStore;
use crate::error::ApiError;
use duplex_kernel::artifact::{
    ArtifactState, Channel, InboundArtifact, InvalidTransition, Lifecycle,
};
use duplex_kernel::compat::{
    CompatibilityDecision, CompatibilityPolicy, NormalizedArtifact, ReasonCode, RejectReason,
};
use duplex_kernel::contract::{ContractRegistry, ContractVersion};
use duplex_kernel::dispatch::{DispatchError, DispatchedArtifact, Dispatcher};
use duplex_kernel::scope::{CallerIdentity, Resource, ScopeAuthorizer};
use duplex_kernel::telemetry::{TelemetryEvent, TelemetrySink};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Why [`GatewayPipeline::admit`] refused an artifact.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineRejection {
    #[error("no valid credentials presented")]
    Unauthenticated,
    #[error("principal '{principal}' may not access {resource}")]
    Forbidden {
        principal: String,
        resource: Resource,
    },
    #[error("{0}")]
    Incompatible(RejectReason),
    #[error(transparent)]
    Lifecycle(#[from] InvalidTransition),
}

impl PipelineRejection {
    /// Stable reason code, as reported in telemetry and REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineRejection::Unauthenticated => "UNAUTHORIZED",
            PipelineRejection::Forbidden { .. } => "FORBIDDEN",
            PipelineRejection::Incompatible(reason) => reason.code.as_str(),
            PipelineRejection::Lifecycle(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<PipelineRejection> for ApiError {
    fn from(rejection: PipelineRejection) -> Self {
        match rejection {
            PipelineRejection::Unauthenticated => ApiError::Unauthorized,
            PipelineRejection::Forbidden {
                principal,
                resource,
            } => ApiError::Forbidden {
                principal,
                resource: resource.to_string(),
            },
            PipelineRejection::Incompatible(reason) => ApiError::Rejected(reason),
            PipelineRejection::Lifecycle(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// An artifact that reached `Accepted`.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub channel: Channel,
    pub id: String,
    pub resource: String,
    pub identity: Arc<CallerIdentity>,
    pub normalized: NormalizedArtifact,
    pub path_params: HashMap<String, String>,
    pub lifecycle: Lifecycle,
}

/// Result of a completed dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: Value,
    /// Version the payload was normalized to.
    pub served: ContractVersion,
    pub lifecycle: Lifecycle,
}

/// Authentication, authorization, compatibility and dispatch in one place.
pub struct GatewayPipeline {
    registry: Arc<ContractRegistry>,
    policy: CompatibilityPolicy,
    credentials: Arc<CredentialStore>,
    authorizer: ScopeAuthorizer,
    dispatcher: Arc<Dispatcher>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for GatewayPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayPipeline")
            .field("policy", &self.policy)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl GatewayPipeline {
    pub fn new(
        registry: Arc<ContractRegistry>,
        policy: CompatibilityPolicy,
        credentials: Arc<CredentialStore>,
        authorizer: ScopeAuthorizer,
        dispatcher: Arc<Dispatcher>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            registry,
            policy,
            credentials,
            authorizer,
            dispatcher,
            telemetry,
        }
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    /// Take `artifact` from `Received` to `Accepted` against `contract`.
    pub fn admit(
        &self,
        artifact: &InboundArtifact,
        contract: &str,
    ) -> Result<Admitted, PipelineRejection> {
        let channel = artifact.channel();
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(ArtifactState::Authenticating)?;

        let Some(identity) = self.credentials.authenticate(artifact.credential()) else {
            self.telemetry
                .emit(&TelemetryEvent::AuthenticationFailed { channel });
            return self.reject(&mut lifecycle, channel, PipelineRejection::Unauthenticated);
        };

        let resource = Resource::new(channel, artifact.resource());
        if !self.authorizer.authorize(&identity, &resource) {
            self.telemetry.emit(&TelemetryEvent::AuthorizationDenied {
                channel,
                principal: identity.principal().to_string(),
                resource: resource.name.clone(),
            });
            return self.reject(
                &mut lifecycle,
                channel,
                PipelineRejection::Forbidden {
                    principal: identity.principal().to_string(),
                    resource,
                },
            );
        }

        lifecycle.advance(ArtifactState::Validating)?;
        let declared = match artifact
            .declared_version()
            .map(|v| v.trim().parse::<ContractVersion>())
        {
            None => None,
            Some(Ok(version)) => Some(version),
            Some(Err(e)) => {
                let reason = RejectReason::new(ReasonCode::InvalidVersion, format!("{e}"));
                return self.reject(
                    &mut lifecycle,
                    channel,
                    PipelineRejection::Incompatible(reason),
                );
            }
        };

        let normalized = match self.policy.evaluate(
            &self.registry,
            contract,
            declared,
            artifact.payload(),
        ) {
            CompatibilityDecision::Accept(normalized) => normalized,
            CompatibilityDecision::AcceptWithDefaults(normalized, fields) => {
                self.telemetry.emit(&TelemetryEvent::DefaultsApplied {
                    channel,
                    contract: contract.to_string(),
                    fields,
                });
                normalized
            }
            CompatibilityDecision::Reject(reason) => {
                if matches!(
                    reason.code,
                    ReasonCode::ValidationFailed
                        | ReasonCode::MalformedPayload
                        | ReasonCode::TypeMismatch
                ) {
                    self.telemetry.emit(&TelemetryEvent::ValidationFailed {
                        channel,
                        contract: contract.to_string(),
                        reason: reason.message.clone(),
                    });
                }
                return self.reject(
                    &mut lifecycle,
                    channel,
                    PipelineRejection::Incompatible(reason),
                );
            }
        };

        if normalized.forward_compatible {
            self.telemetry.emit(&TelemetryEvent::ForwardVersionAccepted {
                channel,
                contract: contract.to_string(),
                declared: normalized.declared,
                served: normalized.served(),
            });
        }

        lifecycle.advance(ArtifactState::Accepted)?;
        debug!(
            id = artifact.id(),
            contract,
            version = %normalized.served(),
            principal = identity.principal(),
            "artifact accepted"
        );
        Ok(Admitted {
            channel,
            id: artifact.id().to_string(),
            resource: artifact.resource().to_string(),
            identity,
            normalized,
            path_params: artifact.path_params(),
            lifecycle,
        })
    }

    fn reject<T>(
        &self,
        lifecycle: &mut Lifecycle,
        channel: Channel,
        rejection: PipelineRejection,
    ) -> Result<T, PipelineRejection> {
        lifecycle.advance(ArtifactState::Rejected)?;
        self.telemetry.emit(&TelemetryEvent::Rejected {
            channel,
            code: rejection.code().to_string(),
        });
        Err(rejection)
    }

    /// `Accepted → Dispatched`: hand the artifact to its contract handler.
    pub async fn dispatch(
        &self,
        admitted: Admitted,
        attempt: u32,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Admitted {
            channel,
            id,
            resource,
            identity,
            normalized,
            path_params,
            mut lifecycle,
        } = admitted;
        lifecycle
            .advance(ArtifactState::Dispatched)
            .map_err(|e| DispatchError::Failed(e.to_string()))?;

        let contract = normalized.artifact.contract.clone();
        let served = normalized.served();
        let response = self
            .dispatcher
            .dispatch(DispatchedArtifact {
                channel,
                id,
                resource,
                identity,
                normalized,
                attempt,
                path_params,
            })
            .await?;
        // Counts completed handler calls; failed attempts surface as
        // redelivered or abandoned instead.
        self.telemetry.emit(&TelemetryEvent::Dispatched { channel, contract });
        Ok(DispatchOutcome {
            response,
            served,
            lifecycle,
        })
    }
}
