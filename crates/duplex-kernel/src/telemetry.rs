//! Telemetry sink contract.
//!
//! The core never talks to a metrics backend directly. Every countable
//! event (validation failures, rejections, redeliveries, abandonments,
//! drops) is handed to an injected [`TelemetrySink`]. Backend choice lives
//! in the runtime crate.

use crate::artifact::Channel;
use crate::contract::ContractVersion;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// A structured observability event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TelemetryEvent {
    /// A payload failed schema validation.
    ValidationFailed {
        channel: Channel,
        contract: String,
        reason: String,
    },
    /// An artifact reached the `Rejected` terminal state.
    Rejected { channel: Channel, code: String },
    /// A payload declared a version newer than the service knows and was
    /// accepted forward-tolerantly.
    ForwardVersionAccepted {
        channel: Channel,
        contract: String,
        declared: ContractVersion,
        served: ContractVersion,
    },
    /// Schema defaults were filled in during normalization.
    DefaultsApplied {
        channel: Channel,
        contract: String,
        fields: Vec<String>,
    },
    /// No valid credentials were presented.
    AuthenticationFailed { channel: Channel },
    /// An authenticated identity lacked a scope.
    AuthorizationDenied {
        channel: Channel,
        principal: String,
        resource: String,
    },
    /// A pub/sub artifact was discarded without dispatch.
    Dropped {
        channel: Channel,
        reason: String,
    },
    /// An unacknowledged message was dispatched again.
    Redelivered { message_id: String, attempt: u32 },
    /// A message exhausted its delivery attempts and was dead-lettered.
    Abandoned { message_id: String, attempts: u32 },
    /// A duplicate inside the retention window was acknowledged without
    /// dispatch.
    DuplicateSuppressed { message_id: String },
    /// An artifact reached business logic.
    Dispatched { channel: Channel, contract: String },
    /// The pub/sub transport connection ended.
    TransportDisconnected { reason: String },
}

impl TelemetryEvent {
    /// Stable, low-cardinality name used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::ValidationFailed { .. } => "validation_failed",
            TelemetryEvent::Rejected { .. } => "rejected",
            TelemetryEvent::ForwardVersionAccepted { .. } => "forward_version_accepted",
            TelemetryEvent::DefaultsApplied { .. } => "defaults_applied",
            TelemetryEvent::AuthenticationFailed { .. } => "authentication_failed",
            TelemetryEvent::AuthorizationDenied { .. } => "authorization_denied",
            TelemetryEvent::Dropped { .. } => "dropped",
            TelemetryEvent::Redelivered { .. } => "redelivered",
            TelemetryEvent::Abandoned { .. } => "abandoned",
            TelemetryEvent::DuplicateSuppressed { .. } => "duplicate_suppressed",
            TelemetryEvent::Dispatched { .. } => "dispatched",
            TelemetryEvent::TransportDisconnected { .. } => "transport_disconnected",
        }
    }

    /// Channel the event belongs to, when it is channel-specific.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            TelemetryEvent::ValidationFailed { channel, .. }
            | TelemetryEvent::Rejected { channel, .. }
            | TelemetryEvent::ForwardVersionAccepted { channel, .. }
            | TelemetryEvent::DefaultsApplied { channel, .. }
            | TelemetryEvent::AuthenticationFailed { channel }
            | TelemetryEvent::AuthorizationDenied { channel, .. }
            | TelemetryEvent::Dropped { channel, .. }
            | TelemetryEvent::Dispatched { channel, .. } => Some(*channel),
            TelemetryEvent::Redelivered { .. }
            | TelemetryEvent::Abandoned { .. }
            | TelemetryEvent::DuplicateSuppressed { .. } => Some(Channel::PubSub),
            TelemetryEvent::TransportDisconnected { .. } => None,
        }
    }
}

/// Injected logging/metrics interface.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Sink that only writes `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        log_event(event);
    }
}

/// Emit the `tracing` record for an event. Shared by every sink so log
/// output does not depend on the metrics backend.
pub fn log_event(event: &TelemetryEvent) {
    let kind = event.kind();
    match event {
        TelemetryEvent::Dispatched { .. }
        | TelemetryEvent::DefaultsApplied { .. }
        | TelemetryEvent::DuplicateSuppressed { .. } => {
            info!(telemetry = kind, detail = ?event, "gateway event");
        }
        _ => warn!(telemetry = kind, detail = ?event, "gateway event"),
    }
}

/// Sink that keeps per-kind counters and the raw event list in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    counts: Mutex<HashMap<&'static str, u64>>,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events of `kind` seen so far.
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.lock().get(kind).copied().unwrap_or(0)
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        log_event(event);
        *self.counts.lock().entry(event.kind()).or_insert(0) += 1;
        self.events.lock().push(event.clone());
    }
}
