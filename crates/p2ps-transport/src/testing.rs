//! In-process transports for simulation and testing.

use crate::traits::{validate_topic, Delivery, PubSubTransport, QoS, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// A message as seen by the broker, with the publishing client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRecord {
    pub publisher: String,
    pub topic: String,
    pub payload: Bytes,
}

struct Subscriber {
    client_seq: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    history: Mutex<Vec<PublishRecord>>,
    next_client: AtomicU64,
}

/// In-memory broker with exact-match topics and per-topic fan-out.
///
/// Every subscriber of a topic gets every message published on it, the
/// publisher included. Per-topic order is preserved.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create a new broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client to this broker
    pub fn client(&self, client_id: impl Into<String>) -> MemoryClient {
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryClient {
            id: client_id.into(),
            seq: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            subscriptions: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Every message published so far, in publish order
    pub fn history(&self) -> Vec<PublishRecord> {
        self.inner.history.lock().clone()
    }

    /// Messages published on one topic
    pub fn published_on(&self, topic: &str) -> Vec<PublishRecord> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn attach(&self, topic: &str, client_seq: u64, tx: &mpsc::UnboundedSender<Delivery>) {
        let mut topics = self.inner.topics.lock();
        let subs = topics.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s.client_seq == client_seq) {
            subs.push(Subscriber {
                client_seq,
                tx: tx.clone(),
            });
        }
    }

    fn detach(&self, topic: &str, client_seq: u64) {
        let mut topics = self.inner.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.client_seq != client_seq);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn route(&self, publisher: &str, topic: &str, payload: Bytes) {
        self.inner.history.lock().push(PublishRecord {
            publisher: publisher.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
        });

        let topics = self.inner.topics.lock();
        let Some(subs) = topics.get(topic) else {
            trace!(topic, "no subscribers");
            return;
        };
        for sub in subs {
            // A closed receiver only means that client went away.
            let _ = sub.tx.send(Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

/// Client handle connected to a [`MemoryBroker`].
pub struct MemoryClient {
    id: String,
    seq: u64,
    broker: MemoryBroker,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    subscriptions: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl MemoryClient {
    /// Topics this client is subscribed to
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.subscriptions.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Simulate a dropped connection; pending and future calls fail.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let topics: Vec<_> = self.subscriptions.lock().drain().collect();
        for topic in topics {
            self.broker.detach(&topic, self.seq);
        }
        // Wake a pending recv with a sentinel the receiver discards.
        let _ = self.tx.send(Delivery::new(String::new(), Bytes::new()));
    }
}

#[async_trait]
impl PubSubTransport for MemoryClient {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        validate_topic(topic)?;
        self.broker.attach(topic, self.seq, &self.tx);
        self.subscriptions.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.broker.detach(topic, self.seq);
        self.subscriptions.lock().remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        validate_topic(topic)?;
        self.broker.route(&self.id, topic, payload);
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            match rx.recv().await {
                Some(delivery) if delivery.topic.is_empty() => continue,
                Some(delivery) => return Ok(delivery),
                None => return Err(TransportError::Disconnected),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn client_id(&self) -> &str {
        &self.id
    }
}

/// Mock transport that records calls instead of routing them.
pub struct MockTransport {
    id: String,
    published: Mutex<Vec<(String, Bytes)>>,
    subscribed: Mutex<Vec<String>>,
    recv_queue: Mutex<VecDeque<Delivery>>,
    notify: tokio::sync::Notify,
    connected: AtomicBool,
    reject_publish: AtomicBool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::with_id("mock")
    }

    /// Create a new mock transport with a client id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            recv_queue: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            connected: AtomicBool::new(true),
            reject_publish: AtomicBool::new(false),
        }
    }

    /// Inject a delivery into the receive queue
    pub fn inject_recv(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.recv_queue
            .lock()
            .push_back(Delivery::new(topic, payload));
        self.notify.notify_one();
    }

    /// Get published messages
    pub fn get_published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    /// Get subscribed topics, in call order
    pub fn get_subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Clear published messages
    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    /// Make every publish fail with [`TransportError::Rejected`]
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::Relaxed);
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Simulate connect
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl PubSubTransport for MockTransport {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        validate_topic(topic)?;
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.subscribed.lock().retain(|t| t != topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if self.reject_publish.load(Ordering::Relaxed) {
            return Err(TransportError::Rejected("publish rejected by mock".to_string()));
        }
        validate_topic(topic)?;
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery, TransportError> {
        loop {
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            let notified = self.notify.notified();
            if let Some(delivery) = self.recv_queue.lock().pop_front() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn client_id(&self) -> &str {
        &self.id
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}
