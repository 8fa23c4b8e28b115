//! Pub/sub transport boundary.
//!
//! A transport hands the gateway a finite stream of messages per
//! connection. When the stream ends the connection is gone; the subscriber
//! reconnects by calling [`PubSubTransport::connect`] again. Reconnect
//! backoff and broker-side redelivery are the transport's concern.

use crate::artifact::PubSubMessage;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Messages from one connection lifetime.
pub type MessageStream = Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("ack of message {0} failed")]
    Ack(String),
}

impl TransportError {
    /// Whether retrying after a reconnect can succeed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Connect(_))
    }
}

/// Work the gateway sends back to the transport.
#[derive(Debug, Clone)]
pub enum Outbound {
    Ack { message_id: String },
    Publish { topic: String, message: PubSubMessage },
}

#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Open a connection and return its message stream.
    async fn connect(&self) -> Result<MessageStream, TransportError>;

    /// Acknowledge a message to the broker.
    async fn ack(&self, message_id: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, message: PubSubMessage) -> Result<(), TransportError>;

    /// Send one [`Outbound`] item.
    async fn send(&self, item: Outbound) -> Result<(), TransportError> {
        match item {
            Outbound::Ack { message_id } => self.ack(&message_id).await,
            Outbound::Publish { topic, message } => self.publish(&topic, message).await,
        }
    }
}
