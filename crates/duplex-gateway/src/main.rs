//! Duplex Gateway entry point.
//!
//! Loads the configuration file, resolves credential secrets from the
//! environment and serves the REST channel. With `--dev-broker` the pub/sub
//! channel consumes an in-process broker. On unix, `SIGHUP` reloads the
//! schema files.
//!
//! # Environment variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `DUPLEX_CONFIG` | Configuration file, same as `--config`. |
//! | `DUPLEX__<KEY>` | Overrides a configuration key, e.g. `DUPLEX__ACK_TIMEOUT_MS`. |
//! | `DUPLEX_SECRET_<NAME>` | Value of the secret `<name>` referenced by a credential. |
//! | `RUST_LOG` | Log filter, defaults to `duplex_gateway=info,duplex_kernel=info`. |

use anyhow::Context;
use clap::Parser;
use duplex_gateway::bootstrap::Gateway;
use duplex_gateway::broker::InMemoryBroker;
use duplex_kernel::config::load_settings;
use duplex_kernel::dispatch::{Dispatcher, EchoHandler};
use duplex_kernel::secrets::EnvSecretsProvider;
use duplex_kernel::telemetry::TracingTelemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIRECTIVES: &str = "duplex_gateway=info,duplex_kernel=info";

#[derive(Parser, Debug)]
#[command(name = "duplex-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (yaml, yml, toml or json)
    #[arg(short, long, env = "DUPLEX_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Consume an in-process broker instead of an external transport
    #[arg(long)]
    dev_broker: bool,

    /// Log telemetry events only; `/metrics` is not served
    #[arg(long)]
    no_metrics: bool,

    /// Prefix of the environment variables holding credential secrets
    #[arg(long, default_value = "DUPLEX_SECRET_")]
    secret_prefix: String,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = load_settings(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        listen_addr = %settings.listen_addr,
        majors = ?settings.supported_major_versions,
        delivery_mode = ?settings.delivery_mode,
        "configuration loaded"
    );

    let secrets = EnvSecretsProvider::new(cli.secret_prefix.clone());
    let mut builder = Gateway::builder(settings)
        .with_dispatcher(Dispatcher::new().with_fallback(Arc::new(EchoHandler)));
    if cli.no_metrics {
        builder = builder.with_telemetry(Arc::new(TracingTelemetry));
    }
    let gateway = Arc::new(
        builder
            .build(&secrets)
            .await
            .map_err(|report| anyhow::anyhow!("gateway startup failed: {report:?}"))?,
    );

    let subscriber = if cli.dev_broker {
        let (_, handle) = gateway.spawn_subscriber(Arc::new(InMemoryBroker::new()));
        Some(handle)
    } else {
        if !gateway.settings().topics.is_empty() {
            warn!("topic bindings configured but no pub/sub transport selected");
        }
        None
    };

    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.cancel();
        }
    });

    #[cfg(unix)]
    spawn_reload_on_hangup(gateway.clone())?;

    let served = gateway.serve().await;
    gateway.shutdown().await;
    if let Some(handle) = subscriber {
        let _ = handle.await;
    }
    served.map_err(|report| anyhow::anyhow!("gateway stopped with an error: {report:?}"))
}

#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Arc<Gateway>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let shutdown = gateway.shutdown_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, reloading schemas");
                    if let Err(report) = gateway.reload_schemas() {
                        warn!(error = ?report, "schema reload failed, keeping current contracts");
                    }
                }
            }
        }
    });
    Ok(())
}
