//! Business dispatch contract.
//!
//! Once an artifact is `Accepted`, the pipeline hands a
//! [`DispatchedArtifact`] to the [`ContractHandler`] registered for its
//! contract. Handlers are async; they may do I/O and are the only part of the
//! flow that talks to business logic.

use crate::artifact::Channel;
use crate::compat::NormalizedArtifact;
use crate::scope::CallerIdentity;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An accepted artifact on its way to business logic.
#[derive(Debug, Clone)]
pub struct DispatchedArtifact {
    pub channel: Channel,
    /// Request id or message id.
    pub id: String,
    /// REST path or topic.
    pub resource: String,
    pub identity: Arc<CallerIdentity>,
    pub normalized: NormalizedArtifact,
    /// Delivery attempt; always 1 on the REST channel.
    pub attempt: u32,
    /// Route parameters such as `id` in `/v1/orders/{id}`.
    pub path_params: HashMap<String, String>,
}

impl DispatchedArtifact {
    pub fn contract(&self) -> &str {
        &self.normalized.artifact.contract
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("no handler registered for contract '{0}'")]
    NoHandler(String),
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("dispatch cancelled")]
    Cancelled,
}

/// Business logic for one contract.
#[async_trait]
pub trait ContractHandler: Send + Sync {
    async fn handle(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError>;
}

/// Returns the normalized payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ContractHandler for EchoHandler {
    async fn handle(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
        Ok(artifact.normalized.artifact.to_json())
    }
}

/// Routes accepted artifacts to handlers by contract name.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn ContractHandler>>,
    fallback: Option<Arc<dyn ContractHandler>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut contracts: Vec<_> = self.handlers.keys().collect();
        contracts.sort();
        f.debug_struct("Dispatcher")
            .field("contracts", &contracts)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder helper: bind `handler` to `contract`.
    pub fn with_handler(
        mut self,
        contract: impl Into<String>,
        handler: Arc<dyn ContractHandler>,
    ) -> Self {
        self.handlers.insert(contract.into(), handler);
        self
    }

    /// Builder helper: handler for contracts without their own binding.
    pub fn with_fallback(mut self, handler: Arc<dyn ContractHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn register(&mut self, contract: impl Into<String>, handler: Arc<dyn ContractHandler>) {
        self.handlers.insert(contract.into(), handler);
    }

    pub fn handler_for(&self, contract: &str) -> Option<&Arc<dyn ContractHandler>> {
        self.handlers.get(contract).or(self.fallback.as_ref())
    }

    pub async fn dispatch(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
        let handler = self
            .handler_for(artifact.contract())
            .ok_or_else(|| DispatchError::NoHandler(artifact.contract().to_string()))?;
        handler.handle(artifact).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractVersion, ParsedArtifact};
    use serde_json::{Map, json};

    fn artifact(contract: &str) -> DispatchedArtifact {
        let mut values = Map::new();
        values.insert("id".into(), json!(7));
        DispatchedArtifact {
            channel: Channel::Rest,
            id: "req-1".into(),
            resource: "/v1/orders".into(),
            identity: Arc::new(CallerIdentity::new("svc", Vec::new())),
            normalized: NormalizedArtifact {
                declared: ContractVersion::new(1, 0, 0),
                forward_compatible: false,
                artifact: ParsedArtifact {
                    contract: contract.into(),
                    version: ContractVersion::new(1, 0, 0),
                    values,
                    unknown: Map::new(),
                },
            },
            attempt: 1,
            path_params: HashMap::from([("id".to_string(), "7".to_string())]),
        }
    }

    struct Fixed(Value);

    #[async_trait]
    impl ContractHandler for Fixed {
        async fn handle(&self, _artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn dispatches_by_contract_name() {
        let dispatcher = Dispatcher::new()
            .with_handler("OrderRequest", Arc::new(Fixed(json!("orders"))))
            .with_handler("Telemetry", Arc::new(Fixed(json!("telemetry"))));
        assert_eq!(
            dispatcher.dispatch(artifact("Telemetry")).await.unwrap(),
            json!("telemetry")
        );
    }

    #[tokio::test]
    async fn unbound_contract_without_fallback_fails() {
        let dispatcher = Dispatcher::new();
        assert_eq!(
            dispatcher.dispatch(artifact("OrderRequest")).await,
            Err(DispatchError::NoHandler("OrderRequest".into()))
        );
    }

    #[test]
    fn route_parameters_are_exposed_by_name() {
        let artifact = artifact("OrderRequest");
        assert_eq!(artifact.path_param("id"), Some("7"));
        assert_eq!(artifact.path_param("sku"), None);
    }

    #[tokio::test]
    async fn echo_fallback_returns_payload() {
        let dispatcher = Dispatcher::new().with_fallback(Arc::new(EchoHandler));
        assert_eq!(
            dispatcher.dispatch(artifact("Anything")).await.unwrap(),
            json!({"id": 7})
        );
    }
}
