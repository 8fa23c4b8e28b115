//! Common test utilities shared across the `duplex-gateway` integration tests.
//!
//! This module is **not** a standalone test binary. It is declared with
//! `mod common;` inside each integration test file that needs it.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use duplex_gateway::bootstrap::Gateway;
use duplex_kernel::artifact::{HttpMethod, PubSubMessage};
use duplex_kernel::config::{CredentialConfig, GatewaySettings, RestRouteConfig, TopicBinding};
use duplex_kernel::contract::{ContractVersion, FieldSpec, FieldType, SchemaDefinition};
use duplex_kernel::dispatch::{ContractHandler, DispatchError, DispatchedArtifact, Dispatcher};
use duplex_kernel::scope::InMemoryAuditLog;
use duplex_kernel::secrets::StaticSecretsProvider;
use duplex_kernel::telemetry::MemoryTelemetry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::ServiceExt;

pub const ORDERS_KEY: &str = "k-orders";
pub const FLEET_KEY: &str = "k-fleet";

// ─────────────────────────────────────────────────────────────────────────────
// Schemas and settings
// ─────────────────────────────────────────────────────────────────────────────

pub fn schemas() -> Vec<SchemaDefinition> {
    vec![
        SchemaDefinition::new("OrderRequest", ContractVersion::new(1, 0, 0))
            .with_field("id", FieldSpec::required(FieldType::Integer))
            .with_field("amount", FieldSpec::required(FieldType::Number)),
        SchemaDefinition::new("OrderRequest", ContractVersion::new(1, 1, 0))
            .with_field("id", FieldSpec::required(FieldType::Integer))
            .with_field("amount", FieldSpec::required(FieldType::Number))
            .with_field(
                "currency",
                FieldSpec::optional(FieldType::String).with_default("USD"),
            ),
        SchemaDefinition::new("OrderRequest", ContractVersion::new(2, 0, 0))
            .with_field("order_ref", FieldSpec::required(FieldType::String)),
        SchemaDefinition::new("DeviceStatus", ContractVersion::new(1, 0, 0))
            .with_field("device_id", FieldSpec::required(FieldType::String))
            .with_field("online", FieldSpec::required(FieldType::Boolean)),
    ]
}

/// Majors `{1, 2}`, one order route, device topics for every tenant.
pub fn settings() -> GatewaySettings {
    let mut settings = GatewaySettings::new([1, 2]);
    settings.rest_workers = 2;
    settings.pubsub_workers = 2;
    settings.reconnect_delay_ms = 50;
    settings.routes = vec![RestRouteConfig {
        id: "orders".into(),
        path_pattern: "/v1/orders".into(),
        methods: vec![HttpMethod::Post],
        contract: "OrderRequest".into(),
        priority: 0,
    }];
    settings.topics = vec![TopicBinding {
        pattern: "+/devices/#".into(),
        contract: "DeviceStatus".into(),
    }];
    settings.credentials = vec![
        CredentialConfig {
            principal: "orders-svc".into(),
            secret: "orders-key".into(),
            scopes: vec!["rest:/v1/orders/#".into()],
        },
        CredentialConfig {
            principal: "fleet".into(),
            secret: "fleet-key".into(),
            scopes: vec!["pubsub:tenant1/devices/#".into()],
        },
    ];
    settings
}

pub fn secrets() -> StaticSecretsProvider {
    StaticSecretsProvider::new()
        .with_secret("orders-key", ORDERS_KEY)
        .with_secret("fleet-key", FLEET_KEY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording handler
// ─────────────────────────────────────────────────────────────────────────────

/// Echo handler that records every dispatch and can be switched to fail.
#[derive(Default)]
pub struct RecordingHandler {
    dispatched: Mutex<Vec<(String, u32)>>,
    path_params: Mutex<Vec<HashMap<String, String>>>,
    failing: AtomicBool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        let handler = Self::default();
        handler.failing.store(true, Ordering::SeqCst);
        handler
    }

    pub fn calls(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    /// `(id, attempt)` of every dispatch, in order.
    pub fn dispatched(&self) -> Vec<(String, u32)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Route parameters seen by each dispatch, in order.
    pub fn path_params(&self) -> Vec<HashMap<String, String>> {
        self.path_params.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractHandler for RecordingHandler {
    async fn handle(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
        self.dispatched
            .lock()
            .unwrap()
            .push((artifact.id.clone(), artifact.attempt));
        self.path_params
            .lock()
            .unwrap()
            .push(artifact.path_params.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Failed("downstream unavailable".into()));
        }
        Ok(artifact.normalized.artifact.to_json())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub gateway: Gateway,
    pub handler: Arc<RecordingHandler>,
    pub telemetry: Arc<MemoryTelemetry>,
    pub audit: Arc<InMemoryAuditLog>,
}

pub async fn harness(settings: GatewaySettings) -> Harness {
    harness_with(settings, Arc::new(RecordingHandler::default())).await
}

pub async fn harness_with(settings: GatewaySettings, handler: Arc<RecordingHandler>) -> Harness {
    let telemetry = Arc::new(MemoryTelemetry::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let gateway = Gateway::builder(settings)
        .with_schemas(schemas())
        .with_dispatcher(Dispatcher::new().with_fallback(handler.clone()))
        .with_telemetry(telemetry.clone())
        .with_audit_log(audit.clone())
        .build(&secrets())
        .await
        .expect("gateway builds");
    Harness {
        gateway,
        handler,
        telemetry,
        audit,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST helpers
// ─────────────────────────────────────────────────────────────────────────────

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(app: &Router, request: Request<Body>) -> Reply {
    let response = app.clone().oneshot(request).await.expect("request served");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Reply {
        status,
        headers,
        body,
    }
}

/// `POST path` with an optional API key and contract version.
pub async fn post_json(
    app: &Router,
    path: &str,
    key: Option<&str>,
    version: Option<&str>,
    body: Value,
) -> Reply {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    if let Some(version) = version {
        builder = builder.header("x-contract-version", version);
    }
    let request = builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(app, request).await
}

pub async fn get(app: &Router, path: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .expect("request served");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read");
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pub/sub helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn device_message(id: &str, topic: &str, key: Option<&str>, body: Value) -> PubSubMessage {
    let message = PubSubMessage::new(topic, serde_json::to_vec(&body).unwrap()).with_id(id);
    match key {
        Some(key) => message.with_header("x-api-key", key),
        None => message,
    }
}

/// Poll `condition` until it holds, failing the test after ~5s.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
