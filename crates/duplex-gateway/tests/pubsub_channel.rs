//! Pub/sub channel integration tests over the in-memory broker.

mod common;

use async_trait::async_trait;
use common::*;
use duplex_gateway::broker::InMemoryBroker;
use duplex_gateway::dead_letter::DeadLetterKind;
use duplex_gateway::pubsub::{ORIGINAL_MESSAGE_ID_HEADER, ORIGINAL_TOPIC_HEADER};
use duplex_kernel::config::InvalidMessagePolicy;
use duplex_kernel::delivery::{DeliveryMode, DeliveryState};
use duplex_kernel::dispatch::{ContractHandler, DispatchError, DispatchedArtifact, Dispatcher};
use duplex_kernel::secrets::StaticSecretsProvider;
use duplex_kernel::telemetry::MemoryTelemetry;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn status(device: &str) -> Value {
    json!({"device_id": device, "online": true})
}

#[tokio::test]
async fn bound_message_is_dispatched_and_acked() {
    let h = harness(settings()).await;
    let broker = Arc::new(InMemoryBroker::new());
    let (channel, handle) = h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        status("d7"),
    ));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    assert_eq!(h.handler.dispatched(), vec![("m1".to_string(), 1)]);
    assert_eq!(
        channel.tracker().get("m1").map(|r| r.state),
        Some(DeliveryState::Acknowledged)
    );
    assert_eq!(h.telemetry.count("dispatched"), 1);

    h.gateway.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("subscriber stops on shutdown")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_message_is_redelivered_then_abandoned() {
    let mut settings = settings();
    settings.ack_timeout_ms = 30_000;
    settings.max_delivery_attempts = 3;
    let h = harness_with(settings, Arc::new(RecordingHandler::failing())).await;
    let broker = Arc::new(InMemoryBroker::new());
    let (channel, _handle) = h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        status("d7"),
    ));

    tokio::time::sleep(Duration::from_secs(31)).await;
    let record = channel.tracker().get("m1").unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.state, DeliveryState::Redelivered);
    assert_eq!(h.telemetry.count("redelivered"), 1);

    tokio::time::sleep(Duration::from_secs(69)).await;
    assert_eq!(h.telemetry.count("abandoned"), 1);
    assert_eq!(
        channel.tracker().get("m1").map(|r| r.state),
        Some(DeliveryState::Abandoned)
    );
    let attempts: Vec<u32> = h.handler.dispatched().iter().map(|(_, a)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.telemetry.count("dispatched"), 0);

    let dead = h.gateway.dead_letters().entries();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, "m1");
    assert_eq!(dead[0].kind, DeadLetterKind::Abandoned);
    assert_eq!(dead[0].attempt_count, 3);
    assert_eq!(broker.acked(), vec!["m1"]);

    h.gateway.shutdown().await;
}

#[tokio::test]
async fn exactly_once_suppresses_redelivered_duplicate() {
    let mut settings = settings();
    settings.delivery_mode = DeliveryMode::ExactlyOnce;
    let h = harness(settings).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    let message = device_message("m1", "tenant1/devices/7", Some(FLEET_KEY), status("d7"));
    broker.publish_inbound(message.clone());
    wait_until("first ack", || broker.acked().len() == 1).await;

    broker.publish_inbound(message);
    wait_until("duplicate ack", || broker.acked().len() == 2).await;

    assert_eq!(h.handler.calls(), 1);
    assert_eq!(h.telemetry.count("duplicate_suppressed"), 1);
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn at_least_once_dispatches_redelivered_duplicate() {
    let h = harness(settings()).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    let message = device_message("m1", "tenant1/devices/7", Some(FLEET_KEY), status("d7"));
    broker.publish_inbound(message.clone());
    wait_until("first ack", || broker.acked().len() == 1).await;

    broker.publish_inbound(message);
    wait_until("second ack", || broker.acked().len() == 2).await;

    assert_eq!(h.handler.calls(), 2);
    assert_eq!(h.telemetry.count("duplicate_suppressed"), 0);
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn unbound_topic_is_dropped_and_acked() {
    let h = harness(settings()).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/billing/7",
        Some(FLEET_KEY),
        status("d7"),
    ));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    assert_eq!(h.telemetry.count("dropped"), 1);
    assert_eq!(h.handler.calls(), 0);
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn message_without_credentials_is_dropped() {
    let h = harness(settings()).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message("m1", "tenant1/devices/7", None, status("d7")));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    assert_eq!(h.telemetry.count("authentication_failed"), 1);
    assert_eq!(h.telemetry.count("dropped"), 1);
    assert!(h.gateway.dead_letters().is_empty());
    assert_eq!(h.handler.calls(), 0);
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn out_of_scope_topic_is_denied_and_audited() {
    let h = harness(settings()).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant2/devices/5",
        Some(FLEET_KEY),
        status("d5"),
    ));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    let denials = h.audit.entries();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].principal, "fleet");
    assert_eq!(denials[0].resource.name, "tenant2/devices/5");
    assert_eq!(h.telemetry.count("authorization_denied"), 1);
    assert!(h.gateway.dead_letters().is_empty());
    assert_eq!(h.handler.calls(), 0);
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn invalid_payload_is_dead_lettered_and_republished() {
    let mut settings = settings();
    settings.dead_letter_topic = Some("dlq".into());
    let h = harness(settings).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        json!({"device_id": "d7"}),
    ));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    let dead = h.gateway.dead_letters().entries();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].kind, DeadLetterKind::Rejected);
    assert!(dead[0].reason.contains("online"));

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let (topic, envelope) = &published[0];
    assert_eq!(topic, "dlq");
    assert_eq!(envelope.headers[ORIGINAL_MESSAGE_ID_HEADER], "m1");
    assert_eq!(envelope.headers[ORIGINAL_TOPIC_HEADER], "tenant1/devices/7");
    assert_eq!(h.handler.calls(), 0);

    let (status, body) = get(&h.gateway.router(), "/v1/dead-letters").await;
    assert_eq!(status, axum::http::StatusCode::OK);
    let listing: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(listing["dead_letters"][0]["message_id"], "m1");
    assert_eq!(listing["dead_letters"][0]["kind"], "rejected");
    h.gateway.shutdown().await;
}

#[tokio::test]
async fn drop_policy_discards_invalid_payload() {
    let mut settings = settings();
    settings.invalid_message_policy = InvalidMessagePolicy::Drop;
    settings.dead_letter_topic = Some("dlq".into());
    let h = harness(settings).await;
    let broker = Arc::new(InMemoryBroker::new());
    h.gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        json!({"device_id": 7, "online": true}),
    ));

    wait_until("ack of m1", || broker.acked() == vec!["m1"]).await;
    assert!(h.gateway.dead_letters().is_empty());
    assert!(broker.published().is_empty());
    assert_eq!(h.telemetry.count("dropped"), 1);
    h.gateway.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-topic ordering
// ─────────────────────────────────────────────────────────────────────────────

/// Sleeps or fails for selected ids and records the order handlers finish in.
#[derive(Default)]
struct OrderedHandler {
    delays: HashMap<&'static str, Duration>,
    failing: HashSet<&'static str>,
    running: AtomicBool,
    overlapped: AtomicBool,
    completed: Mutex<Vec<String>>,
    attempts: Mutex<Vec<(String, u32)>>,
}

impl OrderedHandler {
    fn with_delay(mut self, id: &'static str, delay: Duration) -> Self {
        self.delays.insert(id, delay);
        self
    }

    fn with_failure(mut self, id: &'static str) -> Self {
        self.failing.insert(id);
        self
    }

    fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    fn attempts(&self) -> Vec<(String, u32)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractHandler for OrderedHandler {
    async fn handle(&self, artifact: DispatchedArtifact) -> Result<Value, DispatchError> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.attempts
            .lock()
            .unwrap()
            .push((artifact.id.clone(), artifact.attempt));
        if let Some(delay) = self.delays.get(artifact.id.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        self.running.store(false, Ordering::SeqCst);
        if self.failing.contains(artifact.id.as_str()) {
            return Err(DispatchError::Failed("downstream unavailable".into()));
        }
        self.completed.lock().unwrap().push(artifact.id.clone());
        Ok(artifact.normalized.artifact.to_json())
    }
}

async fn ordered_gateway(
    settings: duplex_kernel::config::GatewaySettings,
    handler: Arc<OrderedHandler>,
) -> (duplex_gateway::Gateway, Arc<MemoryTelemetry>) {
    let telemetry = Arc::new(MemoryTelemetry::new());
    let gateway = duplex_gateway::Gateway::builder(settings)
        .with_schemas(schemas())
        .with_dispatcher(Dispatcher::new().with_fallback(handler))
        .with_telemetry(telemetry.clone())
        .build(&secrets())
        .await
        .unwrap();
    (gateway, telemetry)
}

#[tokio::test]
async fn same_topic_messages_complete_in_arrival_order() {
    let mut settings = settings();
    settings.pubsub_workers = 8;
    let handler = Arc::new(
        OrderedHandler::default().with_delay("m1", Duration::from_millis(200)),
    );
    let (gateway, _telemetry) = ordered_gateway(settings, handler.clone()).await;
    let broker = Arc::new(InMemoryBroker::new());
    gateway.spawn_subscriber(broker.clone());

    for id in ["m1", "m2"] {
        broker.publish_inbound(device_message(
            id,
            "tenant1/devices/7",
            Some(FLEET_KEY),
            status("d7"),
        ));
    }

    wait_until("both acks", || broker.acked().len() == 2).await;
    assert_eq!(handler.completed(), vec!["m1", "m2"]);
    assert_eq!(broker.acked(), vec!["m1", "m2"]);
    assert!(!handler.overlapped.load(Ordering::SeqCst));
    gateway.shutdown().await;
}

#[tokio::test]
async fn different_topics_are_dispatched_in_parallel() {
    let mut settings = settings();
    settings.pubsub_workers = 8;
    let handler = Arc::new(
        OrderedHandler::default().with_delay("m1", Duration::from_millis(200)),
    );
    let (gateway, _telemetry) = ordered_gateway(settings, handler.clone()).await;
    let broker = Arc::new(InMemoryBroker::new());
    gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        status("d7"),
    ));
    broker.publish_inbound(device_message(
        "m2",
        "tenant1/devices/8",
        Some(FLEET_KEY),
        status("d8"),
    ));

    wait_until("both acks", || broker.acked().len() == 2).await;
    assert_eq!(handler.completed(), vec!["m2", "m1"]);
    assert_eq!(broker.acked(), vec!["m2", "m1"]);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_message_holds_its_topic_until_abandoned() {
    let mut settings = settings();
    settings.ack_timeout_ms = 30_000;
    settings.max_delivery_attempts = 2;
    let handler = Arc::new(OrderedHandler::default().with_failure("m1"));
    let (gateway, telemetry) = ordered_gateway(settings, handler.clone()).await;
    let broker = Arc::new(InMemoryBroker::new());
    let (channel, _handle) = gateway.spawn_subscriber(broker.clone());

    for id in ["m1", "m2"] {
        broker.publish_inbound(device_message(
            id,
            "tenant1/devices/7",
            Some(FLEET_KEY),
            status("d7"),
        ));
    }

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        handler.attempts(),
        vec![("m1".to_string(), 1), ("m1".to_string(), 2)]
    );
    assert!(channel.tracker().get("m2").is_none());

    tokio::time::sleep(Duration::from_secs(31)).await;
    wait_until("m2 acked", || broker.acked() == vec!["m1", "m2"]).await;
    assert_eq!(telemetry.count("abandoned"), 1);
    assert_eq!(telemetry.count("dispatched"), 1);
    assert_eq!(handler.completed(), vec!["m2"]);
    assert_eq!(
        channel.tracker().get("m2").map(|r| (r.state, r.attempt_count)),
        Some((DeliveryState::Acknowledged, 1))
    );
    gateway.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection loss
// ─────────────────────────────────────────────────────────────────────────────

/// Blocks every dispatch until released.
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
async fn ack_is_queued_while_disconnected_and_flushed_on_reconnect() {
    let handler = Arc::new(GatedHandler::default());
    let telemetry = Arc::new(MemoryTelemetry::new());
    let gateway = duplex_gateway::Gateway::builder(settings())
        .with_schemas(schemas())
        .with_dispatcher(Dispatcher::new().with_fallback(handler.clone()))
        .with_telemetry(telemetry.clone())
        .build(&secrets())
        .await
        .unwrap();
    let broker = Arc::new(InMemoryBroker::new());
    let (channel, _handle) = gateway.spawn_subscriber(broker.clone());

    broker.publish_inbound(device_message(
        "m1",
        "tenant1/devices/7",
        Some(FLEET_KEY),
        status("d7"),
    ));
    wait_until("dispatch entered", || handler.entered.load(Ordering::SeqCst) == 1).await;

    broker.fail_next_connects(u32::MAX);
    broker.disconnect();
    wait_until("disconnect observed", || {
        telemetry.count("transport_disconnected") >= 1
    })
    .await;

    handler.release.notify_one();
    wait_until("ack held", || channel.outbound_len() == 1).await;
    assert!(broker.acked().is_empty());

    broker.fail_next_connects(0);
    wait_until("ack flushed", || broker.acked() == vec!["m1"]).await;
    assert_eq!(channel.outbound_len(), 0);
    assert!(broker.connects() >= 2);
    gateway.shutdown().await;
}

#[tokio::test]
async fn full_outbound_queue_drops_with_event() {
    let mut settings = settings();
    settings.outbound_queue_capacity = 1;
    let h = harness(settings).await;
    // Never connected: every ack fails with a connection loss.
    let channel = h.gateway.pubsub_channel(Arc::new(InMemoryBroker::new()));

    channel.receive(device_message("m1", "nowhere", None, json!({})));
    channel.receive(device_message("m2", "nowhere", None, json!({})));

    wait_until("overflow drop", || h.telemetry.count("dropped") == 3).await;
    assert_eq!(channel.outbound_len(), 1);
}

#[tokio::test]
async fn startup_fails_on_topic_bound_to_unknown_contract() {
    let mut settings = settings();
    settings.topics[0].contract = "Unknown".into();
    let err = duplex_gateway::Gateway::builder(settings)
        .with_schemas(schemas())
        .build(&StaticSecretsProvider::new())
        .await
        .unwrap_err();
    assert!(format!("{err:?}").contains("Unknown"));
}
