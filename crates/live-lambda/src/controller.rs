//! Bridge - relays one invocation to the remote worker and waits for its reply.
//!
//! Flow:
//! 1. First call only: connect, install the receive loop, subscribe to this
//!    worker's reply topic, snapshot the environment
//! 2. Register a waiter for the request id
//! 3. Publish `function.invoked` as fragments on the shared events topic
//! 4. Wait for `function.success` / `function.error`, the deadline, or cancellation
//! 5. On deadline: best-effort `function.timeout` to the remote side

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::{CodecError, FragmentCodec};
use crate::bridge::correlation::{CorrelationTable, WaitOutcome};
use crate::bridge::protocol::{Message, MessageType, Properties, WorkerId};
use crate::bridge::transport::{InboundMessage, QoS, Transport, TransportError};
use crate::config::{BridgeConfig, Topics};
use crate::context::Invocation;
use crate::environment::EnvironmentSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to connect bridge transport: {0}")]
    Connect(#[source] TransportError),
    #[error("failed to subscribe to worker topic: {0}")]
    Subscribe(#[source] TransportError),
    #[error("invocation context has no request id")]
    MissingRequestId,
    #[error("failed to encode message: {0}")]
    Encode(#[from] CodecError),
    #[error("failed to publish message: {0}")]
    Publish(#[source] TransportError),
    /// The remote handler failed; `message` is its error text.
    #[error("{message}")]
    Remote {
        error_type: String,
        message: String,
        trace: Vec<String>,
    },
    #[error("invocation deadline exceeded")]
    DeadlineExceeded,
    #[error("invocation cancelled")]
    Cancelled,
    #[error("reply slot dropped before a reply arrived")]
    ResponseDropped,
}

impl BridgeError {
    /// Without a transport no invocation can ever complete; the host should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Subscribe(_))
    }
}

/// Process-wide state established by the first invocation.
struct Session {
    environment: Arc<EnvironmentSnapshot>,
    receive_loop: JoinHandle<()>,
}

pub struct Bridge {
    config: BridgeConfig,
    worker_id: WorkerId,
    topics: Topics,
    transport: Arc<dyn Transport>,
    codec: Arc<FragmentCodec>,
    correlation: Arc<CorrelationTable>,
    /// Set once `connect` succeeds; a retried init after a failed subscribe reuses it.
    transport_connected: AtomicBool,
    session: OnceCell<Session>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Self {
        let topics = config.topics();
        let codec = Arc::new(FragmentCodec::new(config.max_chunk));
        Self {
            config,
            worker_id: WorkerId::generate(),
            topics,
            transport,
            codec,
            correlation: Arc::new(CorrelationTable::new()),
            transport_connected: AtomicBool::new(false),
            session: OnceCell::new(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_connected(&self) -> bool {
        self.session.initialized()
    }

    /// Invocations currently waiting for a reply.
    pub fn pending_invocations(&self) -> usize {
        self.correlation.pending()
    }

    /// Inbound messages currently being reassembled.
    pub fn pending_fragments(&self) -> usize {
        self.codec.pending()
    }

    /// Relay `event` to the remote worker and return its response body.
    pub async fn switch(
        &self,
        event: serde_json::Value,
        invocation: &Invocation,
    ) -> Result<serde_json::Value, BridgeError> {
        let session = self.session.get_or_try_init(|| self.connect()).await?;

        let ctx = &invocation.context;
        if ctx.aws_request_id.is_empty() {
            return Err(BridgeError::MissingRequestId);
        }
        let worker_id = self.worker_id.to_string();
        let request_id = ctx.aws_request_id.clone();
        let function_id = if ctx.function_name.is_empty() {
            self.config.function_name.clone()
        } else {
            ctx.function_name.clone()
        };

        let invoked = Message::new(
            MessageType::Invoked,
            Properties {
                worker_id: worker_id.clone(),
                request_id: request_id.clone(),
                function_id,
                deadline_epoch_millis: ctx.deadline_ms,
                event,
                invocation_context: Some(ctx.clone()),
                environment: session.environment.vars().clone(),
                ..Default::default()
            },
        );
        let frames = self.frames(&invoked)?;

        // Registered before publishing so a fast reply cannot slip past.
        let waiter = self.correlation.register(&worker_id, &request_id);
        tracing::debug!(%request_id, fragments = frames.len(), "Publishing invocation");
        self.publish(frames).await?;

        let outcome = waiter
            .wait(invocation.deadline(), &invocation.cancel_token())
            .await;
        tracing::trace!(%request_id, "Wait finished");

        match outcome {
            WaitOutcome::Success(body) => Ok(body),
            WaitOutcome::Error {
                error_type,
                message,
                trace,
            } => Err(BridgeError::Remote {
                error_type,
                message,
                trace,
            }),
            WaitOutcome::TimedOut => {
                let timeout = Message::new(MessageType::Timeout, invoked.properties);
                self.notify_timeout(&timeout).await;
                Err(BridgeError::DeadlineExceeded)
            }
            WaitOutcome::Cancelled => Err(BridgeError::Cancelled),
            WaitOutcome::Abandoned => Err(BridgeError::ResponseDropped),
        }
    }

    async fn connect(&self) -> Result<Session, BridgeError> {
        if !self.transport_connected.load(Ordering::Acquire) {
            let client_id = self.worker_id.to_string();
            tracing::info!(worker_id = %client_id, "Connecting bridge transport");

            self.transport.connect(&client_id).await.map_err(|e| {
                tracing::error!(error = %e, "Bridge transport connect failed");
                BridgeError::Connect(e)
            })?;
            self.transport_connected.store(true, Ordering::Release);
        }

        // Handler goes in before subscribe so the first reply cannot be missed.
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.handle(Arc::new(move |msg: InboundMessage| {
            if tx.send(msg).is_err() {
                tracing::trace!("Receive loop gone, dropping inbound message");
            }
        }));
        let receive_loop = tokio::spawn(run_receive_loop(
            rx,
            Arc::clone(&self.codec),
            Arc::clone(&self.correlation),
            self.config.fragment_ttl,
        ));

        let topic = self.topics.worker(&self.worker_id);
        if let Err(e) = self.transport.subscribe(&topic, QoS::AtLeastOnce).await {
            tracing::error!(%topic, error = %e, "Bridge transport subscribe failed");
            receive_loop.abort();
            return Err(BridgeError::Subscribe(e));
        }
        tracing::debug!(%topic, "Subscribed to worker topic");

        let environment = Arc::new(EnvironmentSnapshot::capture(&self.config.reserved_env));

        Ok(Session {
            environment,
            receive_loop,
        })
    }

    fn frames(&self, message: &Message) -> Result<Vec<Bytes>, BridgeError> {
        self.codec
            .encode(message)?
            .iter()
            .map(|fragment| {
                fragment
                    .to_payload()
                    .map(Bytes::from)
                    .map_err(|e| BridgeError::Encode(CodecError::Serialize(e)))
            })
            .collect()
    }

    async fn publish(&self, frames: Vec<Bytes>) -> Result<(), BridgeError> {
        let topic = self.topics.events();
        for frame in frames {
            self.transport
                .publish(&topic, QoS::AtLeastOnce, frame)
                .await
                .map_err(BridgeError::Publish)?;
        }
        Ok(())
    }

    /// Tell the remote side to abandon the invocation. Failure is logged only.
    async fn notify_timeout(&self, message: &Message) {
        let request_id = &message.properties.request_id;
        tracing::warn!(%request_id, "Invocation deadline exceeded, notifying worker");

        let result = match self.frames(message) {
            Ok(frames) => self.publish(frames).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(%request_id, error = %e, "Failed to publish timeout notification");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(session) = self.session.get() {
            session.receive_loop.abort();
        }
    }
}

/// Drain inbound transport messages: reassemble, then hand replies to waiters.
async fn run_receive_loop(
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    codec: Arc<FragmentCodec>,
    correlation: Arc<CorrelationTable>,
    fragment_ttl: Duration,
) {
    while let Some(inbound) = rx.recv().await {
        codec.evict_stale(fragment_ttl);
        match codec.ingest_payload(&inbound.payload) {
            Ok(Some(message)) => {
                tracing::debug!(kind = %message.kind, topic = %inbound.topic, "Received message");
                correlation.resolve(message);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(topic = %inbound.topic, error = %e, "Dropping malformed inbound payload");
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::MemoryTransport;
    use crate::context::{CancellationToken, InvocationContext};
    use crate::test_support::{RemoteWorker, decode_all};
    use serde_json::json;

    fn setup(config: BridgeConfig) -> (Arc<MemoryTransport>, Arc<Bridge>) {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = Arc::new(Bridge::new(config, transport.clone()));
        (transport, bridge)
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new("todos", "dev").with_function_name("todos-dev-api")
    }

    fn invocation(request_id: &str, timeout_ms: u64) -> Invocation {
        Invocation::new(
            InvocationContext::new(request_id).with_timeout(Duration::from_millis(timeout_ms)),
        )
    }

    #[tokio::test]
    async fn round_trip_returns_remote_body() {
        let (transport, bridge) = setup(config());
        let mut worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            let props = &msg.properties;
            Some(Message::success(
                &props.worker_id,
                &props.request_id,
                json!({ "echo": props.event.clone() }),
            ))
        });

        let body = bridge
            .switch(json!({"path": "/todos"}), &invocation("req-1", 5_000))
            .await
            .unwrap();
        assert_eq!(body, json!({"echo": {"path": "/todos"}}));

        let invoked = worker.received.recv().await.unwrap();
        assert_eq!(invoked.kind, MessageType::Invoked);
        let props = invoked.properties;
        assert_eq!(props.worker_id, bridge.worker_id().to_string());
        assert_eq!(props.request_id, "req-1");
        assert_eq!(props.function_id, "todos-dev-api");
        assert!(props.deadline_epoch_millis > 0);
        assert_eq!(
            props.invocation_context.map(|c| c.aws_request_id),
            Some("req-1".to_string())
        );
        for reserved in ["PATH", "SLS_STAGE", "_HANDLER"] {
            assert!(!props.environment.contains_key(reserved));
        }
        assert_eq!(bridge.pending_invocations(), 0);
    }

    #[tokio::test]
    async fn initializes_once_across_invocations() {
        let (transport, bridge) = setup(config());
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            Some(Message::success(
                &msg.properties.worker_id,
                &msg.properties.request_id,
                json!("ok"),
            ))
        });

        for i in 0..3 {
            let inv = invocation(&format!("req-{i}"), 5_000);
            assert_eq!(bridge.switch(json!(null), &inv).await.unwrap(), json!("ok"));
        }

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(
            transport.client_id(),
            Some(bridge.worker_id().to_string())
        );
        assert_eq!(
            transport.subscriptions(),
            vec![bridge.topics().worker(&bridge.worker_id())]
        );
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (transport, bridge) = setup(config());
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            let mut reply = Message::error(
                &msg.properties.worker_id,
                &msg.properties.request_id,
                "Cannot read properties of undefined",
            );
            reply.properties.error_type = "TypeError".to_string();
            Some(reply)
        });

        let err = bridge
            .switch(json!({}), &invocation("req-1", 5_000))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot read properties of undefined");
        assert!(matches!(
            err,
            BridgeError::Remote { ref error_type, .. } if error_type == "TypeError"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_publishes_one_timeout() {
        let (transport, bridge) = setup(config());
        let mut worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |_| None);

        let err = bridge
            .switch(json!({"slow": true}), &invocation("req-slow", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded));

        assert_eq!(worker.received.recv().await.unwrap().kind, MessageType::Invoked);
        let timeout = worker.received.recv().await.unwrap();
        assert_eq!(timeout.kind, MessageType::Timeout);
        assert_eq!(timeout.properties.request_id, "req-slow");
        assert_eq!(
            timeout.properties.worker_id,
            bridge.worker_id().to_string()
        );

        let timeouts = decode_all(&transport.published())
            .into_iter()
            .filter(|m| m.kind == MessageType::Timeout)
            .count();
        assert_eq!(timeouts, 1);
        assert_eq!(bridge.pending_invocations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_publish_failure_does_not_mask_deadline() {
        let (transport, bridge) = setup(config());

        // Connect with a working transport, then break publishing mid-wait.
        let pending = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .switch(json!(null), &invocation("req-1", 100))
                    .await
            })
        };
        while transport.published().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.set_fail_publish(true);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::DeadlineExceeded));
        // One invoked fragment plus exactly one timeout attempt.
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_sends_no_timeout() {
        let (transport, bridge) = setup(config());
        let cancel = CancellationToken::new();
        let inv = invocation("req-1", 60_000).with_cancel_token(cancel.clone());

        let pending = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.switch(json!(null), &inv).await })
        };
        while transport.published().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));
        let kinds: Vec<_> = decode_all(&transport.published())
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MessageType::Invoked]);
        assert_eq!(bridge.pending_invocations(), 0);
    }

    #[tokio::test]
    async fn ignores_replies_for_other_workers_and_garbage() {
        let (transport, bridge) = setup(config());
        let mut worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |_| None);

        let pending = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .switch(json!(null), &invocation("req-1", 5_000))
                    .await
            })
        };
        let invoked = worker.received.recv().await.unwrap();
        let topic = bridge.topics().worker(&bridge.worker_id());
        let codec = FragmentCodec::default();

        assert!(transport.inject(&topic, "this is not a fragment"));
        let stranger_id = WorkerId::generate().to_string();
        let stranger = Message::success(&stranger_id, "req-1", json!("wrong"));
        for fragment in codec.encode(&stranger).unwrap() {
            transport.inject(&topic, fragment.to_payload().unwrap());
        }
        let mine = Message::success(&invoked.properties.worker_id, "req-1", json!("right"));
        for fragment in codec.encode(&mine).unwrap() {
            transport.inject(&topic, fragment.to_payload().unwrap());
        }

        assert_eq!(pending.await.unwrap().unwrap(), json!("right"));
    }

    #[tokio::test]
    async fn concurrent_invocations_each_get_their_reply() {
        let (transport, bridge) = setup(config());
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            let props = &msg.properties;
            Some(Message::success(
                &props.worker_id,
                &props.request_id,
                json!(props.request_id.clone()),
            ))
        });

        let (inv_a, inv_b, inv_c) = (
            invocation("req-a", 5_000),
            invocation("req-b", 5_000),
            invocation("req-c", 5_000),
        );
        let (a, b, c) = tokio::join!(
            bridge.switch(json!(1), &inv_a),
            bridge.switch(json!(2), &inv_b),
            bridge.switch(json!(3), &inv_c),
        );
        assert_eq!(a.unwrap(), json!("req-a"));
        assert_eq!(b.unwrap(), json!("req-b"));
        assert_eq!(c.unwrap(), json!("req-c"));
        assert_eq!(bridge.pending_invocations(), 0);
    }

    #[tokio::test]
    async fn large_payloads_are_fragmented_both_ways() {
        let (transport, bridge) = setup(config().with_max_chunk(1_000));
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            let props = &msg.properties;
            Some(Message::success(
                &props.worker_id,
                &props.request_id,
                props.event.clone(),
            ))
        });

        let event = json!({ "blob": "é".repeat(10_000) });
        let body = bridge
            .switch(event.clone(), &invocation("req-1", 5_000))
            .await
            .unwrap();
        assert_eq!(body, event);
        assert!(transport.published().len() > 10);
        assert_eq!(bridge.pending_fragments(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_fatal_and_publishes_nothing() {
        let transport = Arc::new(MemoryTransport::failing_connect());
        let bridge = Bridge::new(config(), transport.clone());

        let err = bridge
            .switch(json!(null), &invocation("req-1", 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connect(_)));
        assert!(err.is_fatal());
        assert!(!bridge.is_connected());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_is_fatal_and_init_is_retried() {
        let (transport, bridge) = setup(config());
        transport.set_fail_subscribe(true);

        let err = bridge
            .switch(json!(null), &invocation("req-1", 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Subscribe(_)));
        assert!(err.is_fatal());
        assert!(!bridge.is_connected());
        assert!(transport.published().is_empty());
        assert_eq!(bridge.pending_invocations(), 0);

        transport.set_fail_subscribe(false);
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            Some(Message::success(
                &msg.properties.worker_id,
                &msg.properties.request_id,
                json!("ok"),
            ))
        });

        let body = bridge
            .switch(json!(null), &invocation("req-2", 5_000))
            .await
            .unwrap();
        assert_eq!(body, json!("ok"));
        assert!(bridge.is_connected());
        // The transport connection from the first attempt is reused.
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(
            transport.subscriptions(),
            vec![bridge.topics().worker(&bridge.worker_id())]
        );
    }

    #[tokio::test]
    async fn failed_connect_is_retried_on_next_call() {
        let transport = Arc::new(MemoryTransport::failing_connect());
        let bridge = Bridge::new(config(), transport.clone());

        for request_id in ["req-1", "req-2"] {
            let err = bridge
                .switch(json!(null), &invocation(request_id, 5_000))
                .await
                .unwrap_err();
            assert!(err.is_fatal());
        }
        assert_eq!(transport.connect_count(), 2);
        assert!(transport.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn missing_request_id_is_rejected_before_publish() {
        let (transport, bridge) = setup(config());
        let inv = Invocation::new(InvocationContext::default());

        let err = bridge.switch(json!(null), &inv).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingRequestId));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn invoked_publish_failure_frees_the_slot() {
        let (transport, bridge) = setup(config());
        transport.set_fail_publish(true);

        let err = bridge
            .switch(json!(null), &invocation("req-1", 5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Publish(_)));
        assert!(!err.is_fatal());
        assert_eq!(bridge.pending_invocations(), 0);
    }

    #[tokio::test]
    async fn topics_follow_config_prefix() {
        let (transport, bridge) = setup(config().with_topic_prefix("serverless"));
        let _worker = RemoteWorker::spawn(&transport, bridge.topics().clone(), |msg| {
            Some(Message::success(
                &msg.properties.worker_id,
                &msg.properties.request_id,
                json!(true),
            ))
        });

        bridge
            .switch(json!(null), &invocation("req-1", 5_000))
            .await
            .unwrap();
        assert!(
            transport
                .published()
                .iter()
                .all(|p| p.topic == "serverless/todos/dev/events")
        );
        assert_eq!(
            transport.subscriptions(),
            vec![format!("serverless/todos/dev/events/{}", bridge.worker_id())]
        );
    }
}
