//! `duplex-gateway`: REST and pub/sub runtime for versioned contracts.
//!
//! This crate provides the concrete implementations of the contracts defined
//! in `duplex-kernel`:
//!
//! | Kernel contract | Implementation |
//! |----------------|----------------|
//! | [`TelemetrySink`](duplex_kernel::telemetry::TelemetrySink) | [`telemetry::PrometheusTelemetry`] |
//! | [`PubSubTransport`](duplex_kernel::transport::PubSubTransport) | [`broker::InMemoryBroker`] |
//! | credential lookup | [`auth::CredentialStore`] |
//! | REST route table | [`router::TrieRouter`] |
//! | topic → contract bindings | [`router::TopicRouter`] |
//!
//! [`bootstrap::Gateway`] wires everything together: an axum router for the
//! REST channel, a subscriber loop for the pub/sub channel, one
//! [`pool::WorkerPool`] per channel and the shared admission
//! [`pipeline::GatewayPipeline`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use duplex_gateway::bootstrap::Gateway;
//! use duplex_gateway::broker::InMemoryBroker;
//! use duplex_kernel::config::load_settings;
//! use duplex_kernel::dispatch::{Dispatcher, EchoHandler};
//! use duplex_kernel::secrets::EnvSecretsProvider;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = load_settings("gateway.yaml").unwrap();
//!     let gateway = Gateway::builder(settings)
//!         .with_dispatcher(Dispatcher::new().with_fallback(Arc::new(EchoHandler)))
//!         .build(&EnvSecretsProvider::default())
//!         .await
//!         .unwrap();
//!
//!     gateway.spawn_subscriber(Arc::new(InMemoryBroker::new()));
//!     gateway.serve().await.unwrap();
//! }
//! ```

pub mod auth;
pub mod bootstrap;
pub mod broker;
pub mod dead_letter;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod pubsub;
pub mod rest;
pub mod router;
pub mod telemetry;

pub use bootstrap::{Gateway, GatewayBuilder};
pub use error::{ApiError, ApiResult};
