//! Pub/sub channel: subscriber loop, redelivery sweeper, outbound queue.
//!
//! ```text
//!  transport.connect() ──► stream ──► receive() ──► tracker.on_receive
//!        ▲                                 │
//!        │ reconnect_delay                 ▼ Dispatch{attempt}
//!        └──── stream ended          pubsub pool ──► pipeline ──► ack
//!
//!  sweeper (every scan interval) ──► Redeliver ──► pubsub pool
//!                                └─► Abandon   ──► dead-letter store
//! ```
//!
//! Acks and dead-letter publishes that fail because the connection is gone
//! wait in a bounded outbound queue and are flushed after the next connect.
//! A full queue drops the item with a counted `Dropped` event.
//!
//! Each topic has a lane. A topic's next message is only dispatched once
//! the previous one has settled, so handlers see
//! a topic's messages in transport order. Different topics run in parallel
//! on the pub/sub worker pool. A message waiting in its lane is not tracked
//! yet; its ack timeout starts when it reaches the head of the lane.

use crate::dead_letter::{DeadLetterEntry, DeadLetterKind, DeadLetterStore};
use crate::pipeline::{GatewayPipeline, PipelineRejection};
use crate::pool::{PoolError, WorkerPool};
use crate::router::TopicRouter;
use dashmap::DashMap;
use duplex_kernel::artifact::{Channel, InboundArtifact, PubSubMessage};
use duplex_kernel::config::{GatewaySettings, InvalidMessagePolicy};
use duplex_kernel::delivery::{DeliveryError, DeliveryTracker, ReceiveOutcome, SweepAction};
use duplex_kernel::telemetry::TelemetryEvent;
use duplex_kernel::transport::{Outbound, PubSubTransport};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the rejection or abandonment reason on dead-letter
/// publishes.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
/// Header carrying the id of the dead-lettered message.
pub const ORIGINAL_MESSAGE_ID_HEADER: &str = "x-original-message-id";
/// Header carrying the topic the dead-lettered message arrived on.
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub invalid_message_policy: InvalidMessagePolicy,
    pub dead_letter_topic: Option<String>,
    pub reconnect_delay: Duration,
    pub scan_interval: Duration,
    pub outbound_capacity: usize,
}

impl SubscriberConfig {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            invalid_message_policy: settings.invalid_message_policy,
            dead_letter_topic: settings.dead_letter_topic.clone(),
            reconnect_delay: settings.reconnect_delay(),
            scan_interval: settings.redelivery_scan_interval(),
            outbound_capacity: settings.outbound_queue_capacity,
        }
    }
}

/// A tracked message kept for redelivery.
#[derive(Debug, Clone)]
struct PendingMessage {
    message: PubSubMessage,
    contract: String,
}

/// Messages of one topic: the one being dispatched and those waiting.
#[derive(Debug)]
struct TopicLane {
    head: String,
    waiting: VecDeque<String>,
}

/// The pub/sub front-end of the gateway.
pub struct PubSubChannel {
    transport: Arc<dyn PubSubTransport>,
    pipeline: Arc<GatewayPipeline>,
    topics: TopicRouter,
    tracker: Arc<DeliveryTracker>,
    pool: Arc<WorkerPool>,
    dead_letters: Arc<DeadLetterStore>,
    pending: DashMap<String, PendingMessage>,
    lanes: Mutex<HashMap<String, TopicLane>>,
    outbound: Mutex<VecDeque<Outbound>>,
    config: SubscriberConfig,
}

impl std::fmt::Debug for PubSubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubChannel")
            .field("pending", &self.pending.len())
            .field("lanes", &self.lanes.lock().len())
            .field("outbound", &self.outbound.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PubSubChannel {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        pipeline: Arc<GatewayPipeline>,
        topics: TopicRouter,
        tracker: Arc<DeliveryTracker>,
        pool: Arc<WorkerPool>,
        dead_letters: Arc<DeadLetterStore>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            transport,
            pipeline,
            topics,
            tracker,
            pool,
            dead_letters,
            pending: DashMap::new(),
            lanes: Mutex::new(HashMap::new()),
            outbound: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Items waiting for the transport to come back.
    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Start the subscriber loop and the redelivery sweeper. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let sweeper = tokio::spawn(channel.clone().sweep_loop(shutdown.clone()));
            channel.subscribe_loop(shutdown).await;
            let _ = sweeper.await;
            info!("pub/sub channel stopped");
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn subscribe_loop(self: Arc<Self>, shutdown: CancellationToken) {
        'connection: loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break 'connection,
                result = self.transport.connect() => result,
            };

            let reason = match connected {
                Ok(mut stream) => {
                    info!("pub/sub transport connected");
                    self.flush_outbound().await;
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'connection,
                            next = stream.next() => match next {
                                Some(message) => self.receive(message),
                                None => break,
                            },
                        }
                    }
                    "stream ended".to_string()
                }
                Err(e) => e.to_string(),
            };

            self.telemetry(TelemetryEvent::TransportDisconnected { reason });
            tokio::select! {
                _ = shutdown.cancelled() => break 'connection,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Handle one message as delivered by the transport.
    pub fn receive(self: &Arc<Self>, message: PubSubMessage) {
        let Some(contract) = self.topics.resolve(&message.topic).map(str::to_string) else {
            self.telemetry(TelemetryEvent::Dropped {
                channel: Channel::PubSub,
                reason: format!("no contract bound to topic '{}'", message.topic),
            });
            self.spawn_ack(message.message_id);
            return;
        };

        if self.pending.contains_key(&message.message_id) {
            debug!(message_id = %message.message_id, "message already in flight");
            return;
        }

        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(&message.topic) {
            lane.waiting.push_back(message.message_id.clone());
            debug!(
                message_id = %message.message_id,
                topic = %message.topic,
                waiting = lane.waiting.len(),
                "message queued behind its topic"
            );
            self.pending.insert(
                message.message_id.clone(),
                PendingMessage { message, contract },
            );
            return;
        }
        let outcome = self.tracker.on_receive(&message.message_id, Instant::now());
        if let ReceiveOutcome::Dispatch { .. } = outcome {
            lanes.insert(
                message.topic.clone(),
                TopicLane {
                    head: message.message_id.clone(),
                    waiting: VecDeque::new(),
                },
            );
        }
        drop(lanes);

        match outcome {
            ReceiveOutcome::Duplicate => self.suppress_duplicate(message.message_id),
            ReceiveOutcome::InFlight => {
                debug!(message_id = %message.message_id, "message already in flight");
            }
            ReceiveOutcome::Dispatch { attempt } => {
                self.pending.insert(
                    message.message_id.clone(),
                    PendingMessage {
                        message: message.clone(),
                        contract: contract.clone(),
                    },
                );
                self.submit(message, contract, attempt);
            }
        }
    }

    fn suppress_duplicate(self: &Arc<Self>, message_id: String) {
        self.telemetry(TelemetryEvent::DuplicateSuppressed {
            message_id: message_id.clone(),
        });
        self.spawn_ack(message_id);
    }

    /// Pass `topic`'s lane on to the next waiting message once `settled` is
    /// done with. Only the lane's head can release it.
    fn release_lane(self: &Arc<Self>, topic: &str, settled: &str) {
        let mut settled = settled.to_string();
        loop {
            let next = {
                let mut lanes = self.lanes.lock();
                let Some(lane) = lanes.get_mut(topic) else {
                    return;
                };
                if lane.head != settled {
                    return;
                }
                match lane.waiting.pop_front() {
                    Some(next) => {
                        lane.head = next.clone();
                        next
                    }
                    None => {
                        lanes.remove(topic);
                        return;
                    }
                }
            };

            let pending = self.pending.get(&next).map(|p| p.value().clone());
            if let Some(pending) = pending {
                match self.tracker.on_receive(&next, Instant::now()) {
                    ReceiveOutcome::Dispatch { attempt } => {
                        self.submit(pending.message, pending.contract, attempt);
                        return;
                    }
                    ReceiveOutcome::Duplicate => {
                        self.pending.remove(&next);
                        self.suppress_duplicate(next.clone());
                    }
                    ReceiveOutcome::InFlight => {
                        debug!(message_id = %next, "queued message already in flight");
                    }
                }
            }
            settled = next;
        }
    }

    fn submit(self: &Arc<Self>, message: PubSubMessage, contract: String, attempt: u32) {
        let message_id = message.message_id.clone();
        let channel = self.clone();
        match self
            .pool
            .submit(async move { channel.process(message, contract, attempt).await })
        {
            Ok(()) => {}
            // The record stays pending; the sweeper retries it after the
            // ack timeout.
            Err(PoolError::Saturated) => {
                warn!(%message_id, attempt, "pub/sub pool saturated, awaiting redelivery");
            }
            Err(e) => warn!(%message_id, attempt, error = %e, "pub/sub pool unavailable"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────────────────

    async fn process(self: &Arc<Self>, message: PubSubMessage, contract: String, attempt: u32) {
        let message_id = message.message_id.clone();
        let topic = message.topic.clone();
        let artifact = InboundArtifact::PubSub(message);

        let admitted = match self.pipeline.admit(&artifact, &contract) {
            Ok(admitted) => admitted,
            Err(rejection) => {
                let InboundArtifact::PubSub(message) = artifact else {
                    return;
                };
                self.handle_rejection(message, rejection, attempt).await;
                return;
            }
        };

        match self.pipeline.dispatch(admitted, attempt).await {
            Ok(_) => match self.tracker.acknowledge(&message_id, Instant::now()) {
                Ok(()) => {
                    self.pending.remove(&message_id);
                    self.send(Outbound::Ack {
                        message_id: message_id.clone(),
                    })
                    .await;
                    self.release_lane(&topic, &message_id);
                }
                Err(DeliveryError::Duplicate { .. }) => {
                    debug!(%message_id, "message already acknowledged");
                }
                Err(e) => debug!(%message_id, error = %e, "late completion ignored"),
            },
            // Left pending: the sweeper redelivers until attempts run out.
            Err(e) => warn!(%message_id, attempt, error = %e, "dispatch failed"),
        }
    }

    async fn handle_rejection(
        self: &Arc<Self>,
        message: PubSubMessage,
        rejection: PipelineRejection,
        attempt: u32,
    ) {
        let message_id = message.message_id.clone();
        if let Err(e) = self.tracker.acknowledge(&message_id, Instant::now()) {
            debug!(%message_id, error = %e, "rejected message already settled");
            return;
        }
        self.pending.remove(&message_id);

        match (&rejection, self.config.invalid_message_policy) {
            (PipelineRejection::Incompatible(_), InvalidMessagePolicy::DeadLetter) => {
                let reason = rejection.to_string();
                self.dead_letter(&message, DeadLetterKind::Rejected, reason, attempt)
                    .await;
            }
            _ => {
                warn!(
                    %message_id,
                    topic = %message.topic,
                    code = rejection.code(),
                    "pub/sub message dropped"
                );
                self.telemetry(TelemetryEvent::Dropped {
                    channel: Channel::PubSub,
                    reason: rejection.code().to_string(),
                });
            }
        }
        self.send(Outbound::Ack {
            message_id: message_id.clone(),
        })
        .await;
        self.release_lane(&message.topic, &message_id);
    }

    async fn dead_letter(
        &self,
        message: &PubSubMessage,
        kind: DeadLetterKind,
        reason: String,
        attempts: u32,
    ) {
        let held = self.dead_letters.record(DeadLetterEntry::new(
            message.message_id.clone(),
            message.topic.clone(),
            kind,
            reason.clone(),
            attempts,
            &message.payload,
        ));
        debug!(held, "dead-letter store updated");

        if let Some(topic) = &self.config.dead_letter_topic {
            let envelope = PubSubMessage::new(topic.clone(), message.payload.clone())
                .with_header(DEAD_LETTER_REASON_HEADER, reason)
                .with_header(ORIGINAL_MESSAGE_ID_HEADER, message.message_id.clone())
                .with_header(ORIGINAL_TOPIC_HEADER, message.topic.clone());
            self.send(Outbound::Publish {
                topic: topic.clone(),
                message: envelope,
            })
            .await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Redelivery
    // ─────────────────────────────────────────────────────────────────────────

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Redeliver overdue messages and dead-letter exhausted ones.
    pub async fn sweep(self: &Arc<Self>) {
        let now = Instant::now();
        for action in self.tracker.sweep_overdue(now) {
            match action {
                SweepAction::Redeliver {
                    message_id,
                    attempt,
                } => {
                    let pending = self.pending.get(&message_id).map(|p| p.value().clone());
                    let Some(pending) = pending else {
                        warn!(%message_id, "overdue message missing from pending cache");
                        continue;
                    };
                    self.telemetry(TelemetryEvent::Redelivered {
                        message_id,
                        attempt,
                    });
                    self.submit(pending.message, pending.contract, attempt);
                }
                SweepAction::Abandon {
                    message_id,
                    attempts,
                } => {
                    self.telemetry(TelemetryEvent::Abandoned {
                        message_id: message_id.clone(),
                        attempts,
                    });
                    let mut topic = None;
                    if let Some((_, pending)) = self.pending.remove(&message_id) {
                        let reason = format!("not acknowledged after {attempts} attempts");
                        self.dead_letter(
                            &pending.message,
                            DeadLetterKind::Abandoned,
                            reason,
                            attempts,
                        )
                        .await;
                        topic = Some(pending.message.topic);
                    }
                    self.send(Outbound::Ack {
                        message_id: message_id.clone(),
                    })
                    .await;
                    if let Some(topic) = topic {
                        self.release_lane(&topic, &message_id);
                    }
                }
            }
        }
        let evicted = self.tracker.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, "expired delivery records evicted");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_ack(self: &Arc<Self>, message_id: String) {
        let channel = self.clone();
        tokio::spawn(async move { channel.send(Outbound::Ack { message_id }).await });
    }

    /// Send `item` now, or hold it until the transport reconnects.
    async fn send(&self, item: Outbound) {
        match self.transport.send(item.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_connection_loss() => self.hold(item),
            Err(e) => warn!(error = %e, "outbound send failed"),
        }
    }

    fn hold(&self, item: Outbound) {
        let mut queue = self.outbound.lock();
        if queue.len() >= self.config.outbound_capacity {
            drop(queue);
            self.telemetry(TelemetryEvent::Dropped {
                channel: Channel::PubSub,
                reason: "outbound queue full".into(),
            });
            return;
        }
        queue.push_back(item);
        debug!(queued = queue.len(), "outbound item held while disconnected");
    }

    async fn flush_outbound(&self) {
        let mut flushed = 0usize;
        loop {
            let next = self.outbound.lock().pop_front();
            let Some(item) = next else {
                break;
            };
            match self.transport.send(item.clone()).await {
                Ok(()) => flushed += 1,
                Err(e) if e.is_connection_loss() => {
                    self.outbound.lock().push_front(item);
                    break;
                }
                Err(e) => warn!(error = %e, "queued outbound send failed"),
            }
        }
        if flushed > 0 {
            info!(flushed, "outbound queue flushed");
        }
    }

    fn telemetry(&self, event: TelemetryEvent) {
        self.pipeline.telemetry().emit(&event);
    }
}
