//! Wire protocol types for bridge <-> remote worker communication.
//!
//! Two layers:
//! - **Message**: one logical event (`function.invoked`, `function.success`, ...)
//! - **Fragment**: a size-bounded slice of a serialized message, the unit actually
//!   published on the transport

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::InvocationContext;

/// This bridge's address on the transport, generated once per process.
///
/// It is the transport client id and the last segment of the reply topic. The
/// remote worker copies it into the `workerId` of every reply, which is how a
/// reply meant for another bridge on the same stage is told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Hyphenated lowercase, the form the remote worker echoes back.
        write!(f, "{}", self.0.hyphenated())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "function.invoked")]
    Invoked,
    #[serde(rename = "function.success")]
    Success,
    #[serde(rename = "function.error")]
    Error,
    #[serde(rename = "function.timeout")]
    Timeout,
    /// Remote worker acknowledged the invocation. Informational only.
    #[serde(rename = "function.ack")]
    Ack,
    /// Any type this bridge does not know about. Ignored, never an error.
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl MessageType {
    /// Terminal replies that complete a pending invocation.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoked => "function.invoked",
            Self::Success => "function.success",
            Self::Error => "function.error",
            Self::Timeout => "function.timeout",
            Self::Ack => "function.ack",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a [`Message`]. Fields that do not apply to a given type stay empty
/// and are left off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function_id: String,

    /// Invocation deadline, unix epoch milliseconds.
    #[serde(rename = "deadline", default, skip_serializing_if = "is_zero")]
    pub deadline_epoch_millis: i64,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub event: serde_json::Value,

    #[serde(rename = "context", default, skip_serializing_if = "Option::is_none")]
    pub invocation_context: Option<InvocationContext>,

    #[serde(rename = "env", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub properties: Properties,
}

impl Message {
    pub fn new(kind: MessageType, properties: Properties) -> Self {
        Self { kind, properties }
    }

    pub fn success(worker_id: &str, request_id: &str, body: serde_json::Value) -> Self {
        Self::new(
            MessageType::Success,
            Properties {
                worker_id: worker_id.to_string(),
                request_id: request_id.to_string(),
                body,
                ..Default::default()
            },
        )
    }

    pub fn error(worker_id: &str, request_id: &str, error_message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            Properties {
                worker_id: worker_id.to_string(),
                request_id: request_id.to_string(),
                error_message: error_message.into(),
                ..Default::default()
            },
        )
    }
}

/// One chunk of a serialized [`Message`].
///
/// All fragments of a message share `id`; `count` is the total number of
/// fragments and `index` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub index: usize,
    pub count: usize,
    pub data: String,
}

impl Fragment {
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
