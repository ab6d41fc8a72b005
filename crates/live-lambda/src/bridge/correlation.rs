//! Correlation of inbound replies with the invocations waiting for them.
//!
//! Each pending invocation owns one slot keyed by `(worker_id, request_id)`.
//! A slot is a oneshot handoff: the receive loop sends the matching reply, the
//! invocation task awaits it racing its deadline and cancellation signal.
//! Dropping the [`Waiter`] frees the slot, so timeouts, cancellation and
//! failed publishes never leave entries behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{Message, MessageType};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CorrelationKey {
    worker_id: String,
    request_id: String,
}

/// Terminal state of a [`Waiter`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Success(serde_json::Value),
    Error {
        error_type: String,
        message: String,
        trace: Vec<String>,
    },
    TimedOut,
    Cancelled,
    /// The slot was dropped without a reply (table torn down).
    Abandoned,
}

struct Slot {
    token: u64,
    tx: oneshot::Sender<Message>,
}

pub struct CorrelationTable {
    slots: DashMap<CorrelationKey, Slot>,
    next_token: AtomicU64,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Open a slot for `request_id`. A second registration for the same key
    /// replaces the first, whose waiter then resolves as [`WaitOutcome::Abandoned`].
    pub fn register(self: &Arc<Self>, worker_id: &str, request_id: &str) -> Waiter {
        let key = CorrelationKey {
            worker_id: worker_id.to_string(),
            request_id: request_id.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if self.slots.insert(key.clone(), Slot { token, tx }).is_some() {
            tracing::warn!(worker_id, request_id, "Replaced pending waiter for request");
        }
        tracing::trace!(worker_id, request_id, "Registered waiter");
        Waiter {
            key,
            token,
            rx: Some(rx),
            table: Arc::clone(self),
        }
    }

    /// Deliver `message` to the waiter it answers. Returns `true` iff a waiter was completed.
    ///
    /// Only `function.success` / `function.error` replies are considered. A reply
    /// without a request id completes the worker's sole pending waiter, if there
    /// is exactly one.
    pub fn resolve(&self, message: Message) -> bool {
        if !message.kind.is_reply() {
            tracing::trace!(kind = %message.kind, "Ignoring non-reply message");
            return false;
        }

        let Some(key) = self.match_key(&message) else {
            tracing::debug!(
                worker_id = %message.properties.worker_id,
                request_id = %message.properties.request_id,
                "No waiter for reply"
            );
            return false;
        };

        let Some((key, slot)) = self.slots.remove(&key) else {
            return false;
        };
        tracing::debug!(
            worker_id = %key.worker_id,
            request_id = %key.request_id,
            kind = %message.kind,
            "Resolved waiter"
        );
        // Receiver gone means the invocation already timed out or was cancelled.
        slot.tx.send(message).is_ok()
    }

    fn match_key(&self, message: &Message) -> Option<CorrelationKey> {
        let props = &message.properties;
        if !props.request_id.is_empty() {
            let key = CorrelationKey {
                worker_id: props.worker_id.clone(),
                request_id: props.request_id.clone(),
            };
            return self.slots.contains_key(&key).then_some(key);
        }

        let mut candidates = self
            .slots
            .iter()
            .filter(|entry| entry.key().worker_id == props.worker_id)
            .map(|entry| entry.key().clone());
        match (candidates.next(), candidates.next()) {
            (Some(key), None) => Some(key),
            (Some(_), Some(_)) => {
                tracing::warn!(
                    worker_id = %props.worker_id,
                    "Reply without request id is ambiguous between pending invocations"
                );
                None
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    fn release(&self, key: &CorrelationKey, token: u64) {
        self.slots.remove_if(key, |_, slot| slot.token == token);
    }
}

/// Handle for one pending invocation. `Pending -> {Success, Error, TimedOut, Cancelled}`.
pub struct Waiter {
    key: CorrelationKey,
    token: u64,
    rx: Option<oneshot::Receiver<Message>>,
    table: Arc<CorrelationTable>,
}

impl Waiter {
    pub fn request_id(&self) -> &str {
        &self.key.request_id
    }

    /// Block until a reply, `deadline`, or `cancel`, whichever comes first.
    ///
    /// `None` deadline waits for a reply or cancellation only.
    pub async fn wait(
        mut self,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let Some(rx) = self.rx.take() else {
            return WaitOutcome::Abandoned;
        };

        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            reply = rx => match reply {
                Ok(message) => into_outcome(message),
                Err(_) => WaitOutcome::Abandoned,
            },
            _ = timeout => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}

fn into_outcome(message: Message) -> WaitOutcome {
    let props = message.properties;
    match message.kind {
        MessageType::Success => WaitOutcome::Success(props.body),
        _ => WaitOutcome::Error {
            error_type: props.error_type,
            message: props.error_message,
            trace: props.trace,
        },
    }
}
