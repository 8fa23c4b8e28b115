//! Prometheus-backed telemetry sink.
//!
//! Every [`TelemetryEvent`] increments `duplex_gateway_events_total`
//! labelled by event kind and channel, and is forwarded to `tracing` through
//! the kernel's shared log formatter. `GET /metrics` renders the registry in
//! the Prometheus text format.

use duplex_kernel::telemetry::{TelemetryEvent, TelemetrySink, log_event};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Metrics sink exposing gateway events to Prometheus.
#[derive(Clone)]
pub struct PrometheusTelemetry {
    registry: Registry,
    events: IntCounterVec,
    dead_letters: IntGauge,
}

impl std::fmt::Debug for PrometheusTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusTelemetry").finish_non_exhaustive()
    }
}

impl PrometheusTelemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let events = IntCounterVec::new(
            Opts::new("duplex_gateway_events_total", "Gateway events by kind and channel"),
            &["kind", "channel"],
        )?;
        let dead_letters = IntGauge::new(
            "duplex_gateway_dead_letters",
            "Entries currently held in the dead-letter store",
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        Ok(Self {
            registry,
            events,
            dead_letters,
        })
    }

    /// Counter value for `(kind, channel)`; `channel` is `"none"` for
    /// channel-less events.
    pub fn count(&self, kind: &str, channel: &str) -> u64 {
        self.events.with_label_values(&[kind, channel]).get()
    }

    pub fn set_dead_letters(&self, n: usize) {
        self.dead_letters.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl TelemetrySink for PrometheusTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        log_event(event);
        let channel = event.channel().map_or("none", |c| c.as_str());
        self.events
            .with_label_values(&[event.kind(), channel])
            .inc();
    }
}
