//! Publish/subscribe transport port.
//!
//! The bridge only needs connect, subscribe, publish and a message callback.
//! Production deployments plug in an MQTT client; [`MemoryTransport`] is an
//! in-process loopback used for local runs and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

/// Delivery guarantee requested for a subscription or publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// A payload received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Callback invoked by the transport for every inbound message.
///
/// Must not block: implementations call it from their network task.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("transport not connected")]
    NotConnected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError>;

    /// Install the inbound message callback, replacing any previous one.
    fn handle(&self, handler: MessageHandler);
}

/// A publish recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Publishes kept by [`MemoryTransport::published`] unless configured otherwise.
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 1_024;

struct MemoryState {
    client_id: Option<String>,
    connects: usize,
    subscriptions: Vec<String>,
    published: VecDeque<Published>,
    log_capacity: usize,
    outbox: Option<mpsc::UnboundedSender<Published>>,
    outbox_taken: bool,
    handler: Option<MessageHandler>,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_publish: bool,
}

/// In-process transport. The most recent publishes are kept in a bounded log
/// and streamed to an outbox once one is taken; [`MemoryTransport::inject`]
/// plays the role of the broker delivering a message.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_PUBLISH_LOG_CAPACITY)
    }

    /// Keep at most `capacity` publishes in the log; older ones are dropped.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                client_id: None,
                connects: 0,
                subscriptions: Vec::new(),
                published: VecDeque::new(),
                log_capacity: capacity.max(1),
                outbox: None,
                outbox_taken: false,
                handler: None,
                fail_connect: false,
                fail_subscribe: false,
                fail_publish: false,
            }),
        }
    }

    /// Transport whose `connect` always fails.
    pub fn failing_connect() -> Self {
        let transport = Self::new();
        transport.lock().fail_connect = true;
        transport
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Receiver of every successful publish made after this call, in order.
    /// Can be taken once; nothing is buffered before it is taken.
    pub fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<Published>> {
        let mut state = self.lock();
        if state.outbox_taken {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.outbox = Some(tx);
        state.outbox_taken = true;
        Some(rx)
    }

    /// Deliver `payload` on `topic` to the installed handler.
    ///
    /// Returns `false` when nobody is subscribed to `topic` or no handler is installed.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let handler = {
            let state = self.lock();
            if !state.subscriptions.iter().any(|t| t == topic) {
                tracing::trace!(topic, "Dropping message for unsubscribed topic");
                return false;
            }
            state.handler.clone()
        };
        let Some(handler) = handler else {
            return false;
        };
        handler(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        });
        true
    }

    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Most recent publish attempts, oldest first, including failed ones.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Memory transport state poisoned");
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, client_id: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        state.client_id = Some(client_id.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.client_id.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        if !state.subscriptions.iter().any(|t| t == topic) {
            state.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError> {
        let published = Published {
            topic: topic.to_string(),
            qos,
            payload,
        };
        let mut state = self.lock();
        if state.client_id.is_none() {
            return Err(TransportError::NotConnected);
        }
        if state.published.len() >= state.log_capacity {
            state.published.pop_front();
        }
        state.published.push_back(published.clone());
        if state.fail_publish {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        let receiver_gone = state
            .outbox
            .as_ref()
            .is_some_and(|tx| tx.send(published).is_err());
        if receiver_gone {
            state.outbox = None;
        }
        Ok(())
    }

    fn handle(&self, handler: MessageHandler) {
        self.lock().handler = Some(handler);
    }
}
