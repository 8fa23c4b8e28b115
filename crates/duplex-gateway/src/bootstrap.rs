//! Gateway assembly and lifecycle.
//!
//! [`GatewayBuilder`] turns validated [`GatewaySettings`] into a running
//! [`Gateway`]:
//!
//! 1. validate settings
//! 2. load schema files (plus any schemas supplied in code) into the
//!    contract registry
//! 3. resolve credential keys through the secrets provider
//! 4. build routers, pools, tracker and pipeline
//!
//! The registry is populated here. [`Gateway::reload_schemas`] swaps in a
//! freshly loaded table later on. Teardown is [`Gateway::shutdown`]: stop
//! the subscriber, then drain both pools.

use crate::auth::CredentialStore;
use crate::dead_letter::DeadLetterStore;
use crate::pipeline::GatewayPipeline;
use crate::pool::WorkerPool;
use crate::pubsub::{PubSubChannel, SubscriberConfig};
use crate::rest::{self, RestState};
use crate::router::{TopicRouter, TrieRouter};
use crate::telemetry::PrometheusTelemetry;
use duplex_kernel::compat::CompatibilityPolicy;
use duplex_kernel::config::{ConfigError, GatewaySettings, load_schema_file};
use duplex_kernel::contract::{ContractError, ContractRegistry, SchemaDefinition};
use duplex_kernel::delivery::DeliveryTracker;
use duplex_kernel::dispatch::Dispatcher;
use duplex_kernel::error::{KernelError, KernelResult};
use duplex_kernel::scope::{AuditLog, InMemoryAuditLog, ScopeAuthorizer};
use duplex_kernel::secrets::SecretsProvider;
use duplex_kernel::telemetry::TelemetrySink;
use duplex_kernel::transport::PubSubTransport;
use error_stack::{Report, ResultExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct GatewayBuilder {
    settings: GatewaySettings,
    dispatcher: Dispatcher,
    schemas: Vec<SchemaDefinition>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl GatewayBuilder {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            dispatcher: Dispatcher::new(),
            schemas: Vec::new(),
            telemetry: None,
            audit: None,
        }
    }

    /// Business handlers, keyed by contract.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Register `schemas` in addition to the configured schema files.
    pub fn with_schemas(mut self, schemas: impl IntoIterator<Item = SchemaDefinition>) -> Self {
        self.schemas.extend(schemas);
        self
    }

    /// Replace the default Prometheus sink. `GET /metrics` is only served
    /// with the default sink.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate, load schemas, resolve secrets and assemble the gateway.
    pub async fn build(self, secrets: &dyn SecretsProvider) -> KernelResult<Gateway> {
        let Self {
            settings,
            dispatcher,
            schemas,
            telemetry,
            audit,
        } = self;

        settings
            .validate()
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("validating gateway settings")?;

        let registry = Arc::new(ContractRegistry::with_unknown_fields(settings.unknown_fields));
        registry
            .register_all(schema_batch(&settings, &schemas)?)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("registering schemas")?;
        check_bound_contracts(&settings, &registry)?;

        let credentials = CredentialStore::from_config(&settings.credentials, secrets).await?;

        let (telemetry, metrics): (Arc<dyn TelemetrySink>, _) = match telemetry {
            Some(sink) => (sink, None),
            None => {
                let prometheus = Arc::new(
                    PrometheusTelemetry::new()
                        .map_err(|e| Report::new(KernelError::Internal(e.to_string())))
                        .attach("registering gateway metrics")?,
                );
                let sink: Arc<dyn TelemetrySink> = prometheus.clone();
                (sink, Some(prometheus))
            }
        };
        let audit: Arc<dyn AuditLog> = match audit {
            Some(audit) => audit,
            None => Arc::new(InMemoryAuditLog::new()),
        };

        let routes = TrieRouter::from_routes(settings.routes.clone())
            .map_err(|e| Report::new(KernelError::Config(ConfigError::Invalid(e.to_string()))))?;
        let topics = TopicRouter::from_bindings(&settings.topics)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("binding topics")?;

        let pipeline = Arc::new(GatewayPipeline::new(
            registry.clone(),
            CompatibilityPolicy::new(settings.supported_major_versions.iter().copied()),
            Arc::new(credentials),
            ScopeAuthorizer::new(audit),
            Arc::new(dispatcher),
            telemetry,
        ));

        let rest_pool = Arc::new(WorkerPool::new(
            "rest",
            settings.rest_workers,
            settings.rest_queue_capacity,
        ));
        let pubsub_pool = Arc::new(WorkerPool::new(
            "pubsub",
            settings.pubsub_workers,
            settings.pubsub_queue_capacity,
        ));

        info!(
            contracts = registry.contracts().len(),
            routes = settings.routes.len(),
            topics = settings.topics.len(),
            majors = ?settings.supported_major_versions,
            "gateway assembled"
        );

        Ok(Gateway {
            tracker: Arc::new(DeliveryTracker::new(settings.delivery_config())),
            dead_letters: Arc::new(DeadLetterStore::new(settings.dead_letter_capacity)),
            routes: Arc::new(routes),
            topics,
            registry,
            pipeline,
            rest_pool,
            pubsub_pool,
            metrics,
            shutdown: CancellationToken::new(),
            builtin_schemas: schemas,
            settings,
        })
    }
}

/// Schemas from every configured file, followed by those supplied in code.
fn schema_batch(
    settings: &GatewaySettings,
    builtin: &[SchemaDefinition],
) -> KernelResult<Vec<SchemaDefinition>> {
    let mut batch = Vec::new();
    for path in &settings.schema_files {
        let loaded = load_schema_file(path)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach(format!("loading schema file {}", path.display()))?;
        info!(path = %path.display(), schemas = loaded.len(), "schema file loaded");
        batch.extend(loaded);
    }
    batch.extend(builtin.iter().cloned());
    Ok(batch)
}

/// Every route and topic binding must name a registered contract.
fn check_bound_contracts(
    settings: &GatewaySettings,
    registry: &ContractRegistry,
) -> KernelResult<()> {
    let bound = settings
        .routes
        .iter()
        .map(|r| (r.id.as_str(), r.contract.as_str()))
        .chain(
            settings
                .topics
                .iter()
                .map(|t| (t.pattern.as_str(), t.contract.as_str())),
        );
    for (owner, contract) in bound {
        if !registry.contains(contract) {
            return Err(Report::new(KernelError::Contract(
                ContractError::UnknownContract(contract.to_string()),
            ))
            .attach(format!("bound by '{owner}'")));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// An assembled gateway: REST router, pub/sub channel factory, shared state.
pub struct Gateway {
    settings: GatewaySettings,
    registry: Arc<ContractRegistry>,
    pipeline: Arc<GatewayPipeline>,
    routes: Arc<TrieRouter>,
    topics: TopicRouter,
    tracker: Arc<DeliveryTracker>,
    rest_pool: Arc<WorkerPool>,
    pubsub_pool: Arc<WorkerPool>,
    dead_letters: Arc<DeadLetterStore>,
    metrics: Option<Arc<PrometheusTelemetry>>,
    shutdown: CancellationToken,
    builtin_schemas: Vec<SchemaDefinition>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("listen_addr", &self.settings.listen_addr)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(settings: GatewaySettings) -> GatewayBuilder {
        GatewayBuilder::new(settings)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn rest_pool(&self) -> &Arc<WorkerPool> {
        &self.rest_pool
    }

    /// Re-read the schema files and swap the contract registry in one step.
    ///
    /// The new table must load cleanly and still define every contract a
    /// route or topic is bound to; otherwise the live registry is kept and
    /// the error returned.
    pub fn reload_schemas(&self) -> KernelResult<usize> {
        let batch = schema_batch(&self.settings, &self.builtin_schemas)?;
        let staged = ContractRegistry::with_unknown_fields(self.settings.unknown_fields);
        staged
            .register_all(batch.clone())
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("registering reloaded schemas")?;
        check_bound_contracts(&self.settings, &staged)?;

        let count = self
            .registry
            .replace_all(batch)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("swapping contract registry")?;
        info!(
            schemas = count,
            contracts = self.registry.contracts().len(),
            "schemas reloaded"
        );
        Ok(count)
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The axum router for the REST channel.
    pub fn router(&self) -> axum::Router {
        let mut state = RestState::new(
            self.pipeline.clone(),
            self.routes.clone(),
            self.rest_pool.clone(),
            self.dead_letters.clone(),
        );
        if let Some(metrics) = &self.metrics {
            state = state.with_metrics(metrics.clone());
        }
        rest::router(state)
    }

    /// Pub/sub channel over `transport`, not yet started.
    pub fn pubsub_channel(&self, transport: Arc<dyn PubSubTransport>) -> Arc<PubSubChannel> {
        Arc::new(PubSubChannel::new(
            transport,
            self.pipeline.clone(),
            self.topics.clone(),
            self.tracker.clone(),
            self.pubsub_pool.clone(),
            self.dead_letters.clone(),
            SubscriberConfig::from_settings(&self.settings),
        ))
    }

    /// Start consuming `transport` until shutdown.
    pub fn spawn_subscriber(
        &self,
        transport: Arc<dyn PubSubTransport>,
    ) -> (Arc<PubSubChannel>, JoinHandle<()>) {
        let channel = self.pubsub_channel(transport);
        let handle = channel.spawn(self.shutdown.clone());
        (channel, handle)
    }

    /// Bind `listen_addr` and serve the REST channel until shutdown.
    pub async fn serve(&self) -> KernelResult<()> {
        let addr = self
            .settings
            .socket_addr()
            .map_err(KernelError::from)
            .map_err(Report::new)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach(format!("binding {addr}"))?;
        info!(addr = %addr, "duplex gateway listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("serving REST channel")
    }

    /// Stop accepting work, stop the subscriber and drain both pools.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.shutdown.cancel();
        self.rest_pool.shutdown().await;
        self.pubsub_pool.shutdown().await;
    }
}
