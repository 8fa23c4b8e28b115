//! REST channel integration tests: the axum router driven with `oneshot`.

mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use duplex_gateway::bootstrap::Gateway;
use duplex_kernel::contract::ContractVersion;
use duplex_kernel::dispatch::{
    ContractHandler, DispatchError, DispatchedArtifact, Dispatcher, EchoHandler,
};
use duplex_kernel::telemetry::MemoryTelemetry;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn older_payload_is_upgraded_with_defaults() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("1.0.0"),
        json!({"id": 1, "amount": 100}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({"id": 1, "amount": 100, "currency": "USD"}));
    assert_eq!(reply.headers["x-contract-version"], "1.1.0");
    assert_eq!(h.handler.calls(), 1);
    assert_eq!(h.telemetry.count("defaults_applied"), 1);
    assert_eq!(h.telemetry.count("dispatched"), 1);
}

#[tokio::test]
async fn unsupported_major_is_rejected_without_dispatch() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("3.0.0"),
        json!({"id": 1, "amount": 100}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "UNSUPPORTED_MAJOR_VERSION");
    assert_eq!(reply.body["error"]["message"], "unsupported major version");
    assert_eq!(reply.body["error"]["details"]["supported_majors"], json!([1, 2]));
    assert_eq!(h.handler.calls(), 0);
    assert_eq!(h.telemetry.count("dispatched"), 0);
    assert_eq!(h.telemetry.count("rejected"), 1);
}

#[tokio::test]
async fn absent_version_is_read_as_oldest_supported() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        None,
        json!({"id": 7, "amount": 3.5}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-contract-version"], "1.1.0");
    assert_eq!(reply.body["currency"], "USD");
}

#[tokio::test]
async fn second_major_is_served_side_by_side() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("2.0.0"),
        json!({"order_ref": "A-17"}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-contract-version"], "2.0.0");
    assert_eq!(reply.body, json!({"order_ref": "A-17"}));
}

#[tokio::test]
async fn newer_minor_is_accepted_and_flagged() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("1.5.0"),
        json!({"id": 1, "amount": 2, "currency": "EUR"}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-contract-version"], "1.1.0");
    assert_eq!(h.telemetry.count("forward_version_accepted"), 1);
}

#[tokio::test]
async fn missing_required_field_lists_it() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("1.1.0"),
        json!({"id": 1}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.body["error"]["code"], "VALIDATION_FAILED");
    assert_eq!(reply.body["error"]["details"]["missing_fields"], json!(["amount"]));
    assert_eq!(h.telemetry.count("validation_failed"), 1);
}

#[tokio::test]
async fn garbage_version_header_is_invalid() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        Some("latest"),
        json!({"id": 1, "amount": 1}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "INVALID_VERSION");
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/orders")
        .header("x-api-key", ORDERS_KEY)
        .body(Body::from("{not json"))
        .unwrap();
    let reply = send(&app, request).await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "MALFORMED_PAYLOAD");
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(&app, "/v1/orders", None, None, json!({"id": 1, "amount": 1})).await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"]["code"], "UNAUTHORIZED");
    assert_eq!(h.telemetry.count("authentication_failed"), 1);
    assert_eq!(h.handler.calls(), 0);
}

#[tokio::test]
async fn bearer_token_authenticates() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/orders")
        .header("authorization", format!("Bearer {ORDERS_KEY}"))
        .body(Body::from(r#"{"id": 1, "amount": 1}"#))
        .unwrap();
    let reply = send(&app, request).await;

    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn identity_without_rest_scope_is_forbidden_and_audited() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(
        &app,
        "/v1/orders",
        Some(FLEET_KEY),
        None,
        json!({"id": 1, "amount": 1}),
    )
    .await;

    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["error"]["code"], "FORBIDDEN");
    let denials = h.audit.entries();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].principal, "fleet");
    assert_eq!(denials[0].resource.name, "/v1/orders");
    assert_eq!(h.handler.calls(), 0);
}

#[tokio::test]
async fn unrouted_path_is_not_found() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let reply = post_json(&app, "/v1/unknown", Some(ORDERS_KEY), None, json!({})).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["error"]["code"], "ROUTE_NOT_FOUND");

    // Route exists but not for GET.
    let (status, _) = get(&app, "/v1/orders").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_contract_listing() {
    let h = harness(settings()).await;
    let app = h.gateway.router();

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"ok\""));

    let (status, body) = get(&app, "/v1/contracts").await;
    assert_eq!(status, StatusCode::OK);
    let listing: serde_json::Value = serde_json::from_str(&body).unwrap();
    let orders = listing["contracts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "OrderRequest")
        .unwrap();
    assert_eq!(orders["versions"], json!(["1.0.0", "1.1.0", "2.0.0"]));
}

#[tokio::test]
async fn metrics_count_rejections_by_kind() {
    let gateway = Gateway::builder(settings())
        .with_schemas(schemas())
        .with_dispatcher(Dispatcher::new().with_fallback(Arc::new(EchoHandler)))
        .build(&secrets())
        .await
        .unwrap();
    let app = gateway.router();

    post_json(&app, "/v1/orders", None, None, json!({"id": 1, "amount": 1})).await;

    let (status, text) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("duplex_gateway_events_total"));
    assert!(text.contains("kind=\"authentication_failed\""));
    assert!(text.contains("duplex_gateway_dead_letters"));
}

#[tokio::test]
async fn metrics_are_absent_with_a_custom_sink() {
    let h = harness(settings()).await;
    let (status, _) = get(&h.gateway.router(), "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn startup_fails_on_route_to_unknown_contract() {
    let mut settings = settings();
    settings.routes[0].contract = "Missing".into();
    let err = Gateway::builder(settings)
        .with_schemas(schemas())
        .build(&secrets())
        .await
        .unwrap_err();
    assert!(format!("{err:?}").contains("Missing"));
}

#[tokio::test]
async fn startup_fails_on_unresolvable_secret() {
    let err = Gateway::builder(settings())
        .with_schemas(schemas())
        .build(&duplex_kernel::secrets::StaticSecretsProvider::new())
        .await
        .unwrap_err();
    assert!(format!("{err:?}").contains("orders-key"));
}

#[tokio::test]
async fn schema_files_are_loaded_at_startup() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("invoices.yaml");
    std::fs::write(
        &path,
        r#"
- name: Invoice
  version: "1.0.0"
  fields:
    number: { type: string, required: true }
    paid: { type: boolean, default: false }
"#,
    )
    .unwrap();

    let mut settings = settings();
    settings.schema_files.push(path);
    settings.routes.push(duplex_kernel::config::RestRouteConfig {
        id: "invoices".into(),
        path_pattern: "/v1/invoices/{id}".into(),
        methods: vec![duplex_kernel::artifact::HttpMethod::Put],
        contract: "Invoice".into(),
        priority: 0,
    });
    settings.credentials[0].scopes.push("rest:/v1/invoices/#".into());
    let h = harness(settings).await;
    assert!(h.gateway.registry().contains("Invoice"));

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/invoices/42")
        .header("x-api-key", ORDERS_KEY)
        .body(Body::from(r#"{"number": "INV-42"}"#))
        .unwrap();
    let reply = send(&h.gateway.router(), request).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({"number": "INV-42", "paid": false}));
    let params = h.handler.path_params();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].get("id").map(String::as_str), Some("42"));
}

/// Holds every dispatch until released.
#[derive(Default)]
struct GatedHandler {
    entered: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl ContractHandler for GatedHandler {
    async fn handle(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(artifact.normalized.artifact.to_json())
    }
}

#[tokio::test]
async fn request_dropped_while_queued_is_never_dispatched() {
    let mut settings = settings();
    settings.rest_workers = 1;
    let handler = Arc::new(GatedHandler::default());
    let telemetry = Arc::new(MemoryTelemetry::new());
    let gateway = Gateway::builder(settings)
        .with_schemas(schemas())
        .with_dispatcher(Dispatcher::new().with_fallback(handler.clone()))
        .with_telemetry(telemetry.clone())
        .build(&secrets())
        .await
        .unwrap();
    let app = gateway.router();

    let first = tokio::spawn({
        let app = app.clone();
        async move {
            post_json(
                &app,
                "/v1/orders",
                Some(ORDERS_KEY),
                None,
                json!({"id": 1, "amount": 1}),
            )
            .await
            .status
        }
    });
    wait_until("first request holds the worker", || {
        handler.entered.load(Ordering::SeqCst) == 1
    })
    .await;

    // The second request queues behind the first; the timeout drops it.
    let second = post_json(
        &app,
        "/v1/orders",
        Some(ORDERS_KEY),
        None,
        json!({"id": 2, "amount": 2}),
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(50), second)
            .await
            .is_err()
    );
    assert_eq!(gateway.rest_pool().snapshot().submitted, 2);

    handler.release.notify_one();
    assert_eq!(first.await.unwrap(), StatusCode::OK);
    wait_until("queued job drained", || {
        gateway.rest_pool().snapshot().completed == 2
    })
    .await;

    assert_eq!(handler.entered.load(Ordering::SeqCst), 1);
    assert_eq!(telemetry.count("dispatched"), 1);
}

const INVOICE_V1: &str = r#"
- name: Invoice
  version: "1.0.0"
  fields:
    number: { type: string, required: true }
    paid: { type: boolean, default: false }
"#;

const INVOICE_V1_1: &str = r#"
- name: Invoice
  version: "1.1.0"
  fields:
    number: { type: string, required: true }
    paid: { type: boolean, default: false }
    currency: { type: string, default: "EUR" }
"#;

#[tokio::test]
async fn schema_reload_swaps_contracts_and_keeps_them_on_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("invoices.yaml");
    std::fs::write(&path, INVOICE_V1).unwrap();

    let mut settings = settings();
    settings.schema_files.push(path.clone());
    settings.routes.push(duplex_kernel::config::RestRouteConfig {
        id: "invoices".into(),
        path_pattern: "/v1/invoices/{id}".into(),
        methods: vec![duplex_kernel::artifact::HttpMethod::Put],
        contract: "Invoice".into(),
        priority: 0,
    });
    settings.credentials[0].scopes.push("rest:/v1/invoices/#".into());
    let h = harness(settings).await;
    let app = h.gateway.router();
    let v1_0 = ContractVersion::new(1, 0, 0);
    let v1_1 = ContractVersion::new(1, 1, 0);

    std::fs::write(&path, format!("{INVOICE_V1}{INVOICE_V1_1}")).unwrap();
    h.gateway.reload_schemas().unwrap();
    assert_eq!(h.gateway.registry().versions("Invoice"), vec![v1_0, v1_1]);

    let request = Request::builder()
        .method("PUT")
        .uri("/v1/invoices/7")
        .header("x-api-key", ORDERS_KEY)
        .header("x-contract-version", "1.0.0")
        .body(Body::from(r#"{"number": "INV-7"}"#))
        .unwrap();
    let reply = send(&app, request).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-contract-version"], "1.1.0");
    assert_eq!(
        reply.body,
        json!({"number": "INV-7", "paid": false, "currency": "EUR"})
    );

    // Unparseable file: the live table stays.
    std::fs::write(&path, "- name: [").unwrap();
    assert!(h.gateway.reload_schemas().is_err());
    assert_eq!(h.gateway.registry().versions("Invoice"), vec![v1_0, v1_1]);

    // A table that drops a bound contract is refused.
    std::fs::write(&path, INVOICE_V1.replace("Invoice", "Receipt")).unwrap();
    let err = h.gateway.reload_schemas().unwrap_err();
    assert!(format!("{err:?}").contains("Invoice"));
    assert!(h.gateway.registry().contains("Invoice"));
    assert!(!h.gateway.registry().contains("Receipt"));
}
