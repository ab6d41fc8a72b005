//! Fragment codec: message <-> size-bounded fragments.
//!
//! Serializes with serde_json, splits on character boundaries, and reassembles
//! by ascending index regardless of arrival order. Reassembly buffers are shared
//! across the process and evicted once complete (or once stale).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::protocol::{Fragment, Message};

/// Transport payload limit in characters.
pub const DEFAULT_MAX_CHUNK: usize = 50_000;

/// Upper bound on remembered completed ids; the oldest is forgotten first.
const COMPLETED_CAPACITY: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed fragment: {0}")]
    MalformedFragment(String),
    #[error("malformed message {id}: {source}")]
    Deserialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

struct PendingMessage {
    parts: BTreeMap<usize, String>,
    first_seen: Instant,
}

impl PendingMessage {
    fn new() -> Self {
        Self {
            parts: BTreeMap::new(),
            first_seen: Instant::now(),
        }
    }
}

pub struct FragmentCodec {
    max_chunk: usize,
    buffers: DashMap<String, PendingMessage>,
    /// Ids reassembled recently. At-least-once delivery redelivers their
    /// fragments; those must not open a new buffer.
    completed: DashMap<String, Instant>,
}

impl Default for FragmentCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK)
    }
}

impl FragmentCodec {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            max_chunk: max_chunk.max(1),
            buffers: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Serialize `message` and split it into fragments sharing a fresh id.
    pub fn encode(&self, message: &Message) -> Result<Vec<Fragment>, CodecError> {
        let json = serde_json::to_string(message).map_err(CodecError::Serialize)?;
        let id = uuid::Uuid::new_v4().to_string();
        let parts = chunk(&json, self.max_chunk);
        let count = parts.len();

        tracing::trace!(fragment_id = %id, count, json_len = json.len(), "Encoded message");

        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, data)| Fragment {
                id: id.clone(),
                index,
                count,
                data: data.to_string(),
            })
            .collect())
    }

    /// Buffer `fragment`; returns the message once every fragment of its id has arrived.
    ///
    /// A duplicate index overwrites the earlier copy.
    pub fn ingest(&self, fragment: Fragment) -> Result<Option<Message>, CodecError> {
        if fragment.count == 0 || fragment.index >= fragment.count {
            return Err(CodecError::MalformedFragment(format!(
                "fragment {} has index {} of {}",
                fragment.id, fragment.index, fragment.count
            )));
        }

        let Fragment {
            id,
            index,
            count,
            data,
        } = fragment;
        tracing::trace!(fragment_id = %id, index, count, "Got fragment");

        if self.completed.contains_key(&id) {
            tracing::trace!(fragment_id = %id, index, "Dropping redelivered fragment");
            return Ok(None);
        }

        let complete = {
            let mut pending = self
                .buffers
                .entry(id.clone())
                .or_insert_with(PendingMessage::new);
            pending.parts.insert(index, data);
            pending.parts.len() == count
        };
        if !complete {
            return Ok(None);
        }

        // Another caller may have completed the same id concurrently.
        let Some((_, pending)) = self.buffers.remove(&id) else {
            return Ok(None);
        };
        self.remember_completed(id.clone());
        tracing::debug!(fragment_id = %id, count, "Got all fragments");

        let data: String = pending.parts.into_values().collect();
        let message = serde_json::from_str(&data)
            .map_err(|source| CodecError::Deserialize { id, source })?;
        Ok(Some(message))
    }

    /// Parse a raw transport payload as a fragment and ingest it.
    pub fn ingest_payload(&self, payload: &[u8]) -> Result<Option<Message>, CodecError> {
        let fragment = Fragment::from_payload(payload)
            .map_err(|e| CodecError::MalformedFragment(e.to_string()))?;
        self.ingest(fragment)
    }

    fn remember_completed(&self, id: String) {
        if self.completed.len() >= COMPLETED_CAPACITY {
            let oldest = self
                .completed
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.completed.remove(&oldest);
            }
        }
        self.completed.insert(id, Instant::now());
    }

    /// Drop partially reassembled messages older than `ttl`, and forget completed
    /// ids older than `ttl`. Returns how many partial messages were dropped.
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        self.completed.retain(|_, at| at.elapsed() < ttl);

        let before = self.buffers.len();
        self.buffers.retain(|id, pending| {
            let keep = pending.first_seen.elapsed() < ttl;
            if !keep {
                tracing::warn!(
                    fragment_id = %id,
                    received = pending.parts.len(),
                    "Evicting incomplete message"
                );
            }
            keep
        });
        before.saturating_sub(self.buffers.len())
    }

    /// Number of messages currently being reassembled.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

/// Split `s` into slices of at most `size` characters. Empty input yields one empty slice.
fn chunk(s: &str, size: usize) -> Vec<&str> {
    if s.is_empty() {
        return vec![s];
    }

    let mut chunks = Vec::with_capacity(s.len() / size + 1);
    let mut start = 0;
    let mut chars = 0;
    for (offset, _) in s.char_indices() {
        if chars == size {
            chunks.push(&s[start..offset]);
            start = offset;
            chars = 0;
        }
        chars += 1;
    }
    chunks.push(&s[start..]);
    chunks
}
