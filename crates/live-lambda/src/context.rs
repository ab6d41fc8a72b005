//! Invocation context handed to a handler by the function runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

/// Platform metadata for one invocation, forwarded verbatim to the remote worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    #[serde(default)]
    pub aws_request_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invoked_function_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_in_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_group_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_stream_name: String,
    /// Unix epoch milliseconds. Zero or negative means no deadline.
    #[serde(default)]
    pub deadline_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_context: Option<serde_json::Value>,
}

impl InvocationContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            aws_request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: i64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    /// Deadline `timeout` from now on the wall clock.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline = now_epoch_millis().saturating_add(millis);
        self.with_deadline_ms(deadline)
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline_ms > 0
    }

    /// Time left before the deadline, `None` when the invocation has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        if !self.has_deadline() {
            return None;
        }
        let left = self.deadline_ms.saturating_sub(now_epoch_millis()).max(0);
        Some(Duration::from_millis(left as u64))
    }
}

/// An invocation in flight: its context plus the runtime's cancellation signal.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub context: InvocationContext,
    cancel_token: CancellationToken,
}

impl Invocation {
    pub fn new(context: InvocationContext) -> Self {
        Self {
            context,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn request_id(&self) -> &str {
        &self.context.aws_request_id
    }

    /// Monotonic instant matching the context's wall-clock deadline.
    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.context
            .remaining()
            .map(|left| tokio::time::Instant::now() + left)
    }
}

pub(crate) fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
