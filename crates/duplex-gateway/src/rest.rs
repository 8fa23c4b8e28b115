//! Axum front-end for the REST channel.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check, always `200 OK`. |
//! | `GET`  | `/metrics` | Prometheus text exposition. |
//! | `GET`  | `/v1/contracts` | Registered contract names and versions. |
//! | `GET`  | `/v1/dead-letters` | Dead-letter store contents, oldest first. |
//! | `ANY`  | *configured routes* | Contract traffic through the gateway pipeline. |
//!
//! Contract traffic is executed on the REST worker pool. When the client goes
//! away before its artifact is dispatched, the handler future is dropped, the
//! drop guard trips the request's cancellation token and the queued job
//! stops before reaching business logic.

use crate::dead_letter::DeadLetterStore;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::{DispatchOutcome, GatewayPipeline};
use crate::pool::{PoolError, WorkerPool};
use crate::router::TrieRouter;
use crate::telemetry::PrometheusTelemetry;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use duplex_kernel::artifact::{HttpMethod, InboundArtifact, RestRequest};
use duplex_kernel::dispatch::DispatchError;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// Response header carrying the version the payload was normalized to.
pub const CONTRACT_VERSION_RESPONSE_HEADER: &str = "x-contract-version";
/// Optional caller-supplied correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ─────────────────────────────────────────────────────────────────────────────
// Shared application state
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state injected into every axum handler via [`State`] extractor.
#[derive(Clone)]
pub struct RestState {
    pipeline: Arc<GatewayPipeline>,
    routes: Arc<TrieRouter>,
    pool: Arc<WorkerPool>,
    dead_letters: Arc<DeadLetterStore>,
    metrics: Option<Arc<PrometheusTelemetry>>,
}

impl RestState {
    pub fn new(
        pipeline: Arc<GatewayPipeline>,
        routes: Arc<TrieRouter>,
        pool: Arc<WorkerPool>,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            pipeline,
            routes,
            pool,
            dead_letters,
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PrometheusTelemetry>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Build the axum [`Router`] for the REST channel.
pub fn router(state: RestState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/contracts", get(list_contracts_handler))
        .route("/v1/dead-letters", get(list_dead_letters_handler))
        .fallback(contract_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "duplex-gateway" }))
}

async fn metrics_handler(State(state): State<RestState>) -> Response {
    let Some(metrics) = &state.metrics else {
        return ApiError::RouteNotFound {
            method: "GET".into(),
            path: "/metrics".into(),
        }
        .into_response();
    };
    metrics.set_dead_letters(state.dead_letters.len());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
        .into_response()
}

/// `GET /v1/contracts`
async fn list_contracts_handler(State(state): State<RestState>) -> impl IntoResponse {
    let registry = state.pipeline.registry();
    let contracts: Vec<serde_json::Value> = registry
        .contracts()
        .into_iter()
        .map(|name| {
            let versions = registry.versions(&name);
            json!({ "name": name, "versions": versions })
        })
        .collect();
    Json(json!({ "contracts": contracts }))
}

/// `GET /v1/dead-letters`
async fn list_dead_letters_handler(State(state): State<RestState>) -> impl IntoResponse {
    Json(json!({ "dead_letters": state.dead_letters.entries() }))
}

/// Contract traffic: route, admit on the REST pool, dispatch.
async fn contract_handler(
    State(state): State<RestState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_contract(state, method, uri, headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_contract(
    state: RestState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let path = uri.path().to_string();
    let not_found = || ApiError::RouteNotFound {
        method: method.to_string(),
        path: path.clone(),
    };
    let http_method = axum_method_to_kernel(&method).ok_or_else(not_found)?;
    let route = state.routes.resolve(&path, http_method).ok_or_else(not_found)?;

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut request = RestRequest::new(&request_id, http_method, &path)
        .with_body(body.to_vec())
        .with_path_params(route.path_params);
    for (name, value) in &headers {
        if let Ok(v) = value.to_str() {
            request = request.with_header(name.as_str(), v);
        }
    }
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        route = %route.route_id,
        contract = %route.contract,
        "inbound request"
    );

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (tx, rx) = oneshot::channel();
    let pipeline = state.pipeline.clone();
    let contract = route.contract;
    state
        .pool
        .submit(async move {
            let artifact = InboundArtifact::Rest(request);
            let result = run_request(&pipeline, artifact, &contract, &cancel).await;
            let _ = tx.send(result);
        })
        .map_err(|e| match e {
            PoolError::Saturated => ApiError::Overloaded("rest"),
            other => ApiError::Internal(other.to_string()),
        })?;

    let outcome = rx
        .await
        .map_err(|_| ApiError::Internal("request worker dropped the response".into()))??;

    let mut response = (StatusCode::OK, Json(outcome.response)).into_response();
    if let Ok(value) = HeaderValue::from_str(&outcome.served.to_string()) {
        response
            .headers_mut()
            .insert(CONTRACT_VERSION_RESPONSE_HEADER, value);
    }
    Ok(response)
}

async fn run_request(
    pipeline: &GatewayPipeline,
    artifact: InboundArtifact,
    contract: &str,
    cancel: &CancellationToken,
) -> ApiResult<DispatchOutcome> {
    if cancel.is_cancelled() {
        debug!(request_id = artifact.id(), "client went away while queued");
        return Err(DispatchError::Cancelled.into());
    }
    let admitted = pipeline.admit(&artifact, contract)?;
    if cancel.is_cancelled() {
        debug!(request_id = artifact.id(), "client went away before dispatch");
        return Err(DispatchError::Cancelled.into());
    }
    Ok(pipeline.dispatch(admitted, 1).await?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Convert an axum [`Method`] to the kernel [`HttpMethod`].
///
/// Returns `None` for methods contract routes never serve (`HEAD`,
/// `OPTIONS`, `CONNECT`, `TRACE`).
fn axum_method_to_kernel(m: &Method) -> Option<HttpMethod> {
    HttpMethod::from_str_ci(m.as_str())
}
