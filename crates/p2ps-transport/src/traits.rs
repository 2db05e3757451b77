//! Transport traits for the publish/subscribe signaling channel.

use async_trait::async_trait;
use bytes::Bytes;

/// Delivery guarantee requested for a subscription or publish.
///
/// Signaling only ever asks for "at least once"; the other levels exist so
/// adapters can map the broker's own vocabulary one to one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// A message handed to a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload bytes (UTF-8 JSON for signaling envelopes)
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe transport used as the only channel between endpoints.
///
/// Implementations deliver messages of one topic in publish order and may
/// deliver a message more than once. A publisher subscribed to the topic it
/// publishes on receives its own message back.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Start receiving messages published on `topic`.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Stop receiving messages published on `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError>;

    /// Receive the next delivery for any subscribed topic (waits).
    async fn recv(&self) -> Result<Delivery, TransportError>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Client identifier used with the broker
    fn client_id(&self) -> &str;
}

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Reject topics a broker would refuse or interpret as a filter.
pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty()
        || topic.contains(['+', '#', '\0'])
        || topic.starts_with('/')
        || topic.ends_with('/')
    {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
