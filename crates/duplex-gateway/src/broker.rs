//! In-process pub/sub transport.
//!
//! [`InMemoryBroker`] implements [`PubSubTransport`] over tokio channels. It
//! backs the integration tests and the binary's `--dev-broker` mode, and can
//! simulate connection loss:
//!
//! - [`disconnect`](InMemoryBroker::disconnect) ends the current stream;
//!   acks and publishes fail with [`TransportError::Disconnected`] until the
//!   subscriber reconnects.
//! - [`fail_next_connects`](InMemoryBroker::fail_next_connects) makes the
//!   next `n` connect attempts fail.
//!
//! Messages published while nobody is connected are buffered and delivered
//! on the next connect.

use async_trait::async_trait;
use duplex_kernel::artifact::PubSubMessage;
use duplex_kernel::transport::{MessageStream, PubSubTransport, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Default)]
struct BrokerState {
    subscriber: Option<mpsc::UnboundedSender<PubSubMessage>>,
    backlog: VecDeque<PubSubMessage>,
    acked: Vec<String>,
    published: Vec<(String, PubSubMessage)>,
    failing_connects: u32,
    connects: u64,
}

impl BrokerState {
    fn is_connected(&self) -> bool {
        self.subscriber.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Tokio-channel broker with one subscriber at a time.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("connected", &state.is_connected())
            .field("backlog", &state.backlog.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to the subscriber, or buffer it until one connects.
    pub fn publish_inbound(&self, message: PubSubMessage) {
        let mut state = self.state.lock();
        let message = match state.subscriber.as_ref() {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        state.backlog.push_back(message);
    }

    /// Drop the current connection.
    pub fn disconnect(&self) {
        if self.state.lock().subscriber.take().is_some() {
            info!("in-memory broker connection dropped");
        }
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.state.lock().connects
    }

    /// Acknowledged message ids, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// `(topic, message)` pairs published by the gateway.
    pub fn published(&self) -> Vec<(String, PubSubMessage)> {
        self.state.lock().published.clone()
    }
}

#[async_trait]
impl PubSubTransport for InMemoryBroker {
    async fn connect(&self) -> Result<MessageStream, TransportError> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect("simulated connect failure".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for message in state.backlog.drain(..) {
            // The receiver is alive in this scope.
            let _ = tx.send(message);
        }
        state.subscriber = Some(tx);
        state.connects += 1;
        debug!(connects = state.connects, "in-memory broker connected");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, message_id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.is_connected() {
            return Err(TransportError::Disconnected);
        }
        state.acked.push(message_id.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: PubSubMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.is_connected() {
            return Err(TransportError::Disconnected);
        }
        state.published.push((topic.to_string(), message));
        Ok(())
    }
}
