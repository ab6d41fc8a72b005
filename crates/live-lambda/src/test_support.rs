//! Fake remote worker driving a [`MemoryTransport`] from the other side.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::codec::FragmentCodec;
use crate::bridge::protocol::Message;
use crate::bridge::transport::{MemoryTransport, Published};
use crate::config::Topics;

pub(crate) struct RemoteWorker {
    /// Every message reassembled from the events topic, in arrival order.
    pub received: mpsc::UnboundedReceiver<Message>,
    handle: JoinHandle<()>,
}

impl RemoteWorker {
    /// Listen on the transport outbox; `reply` decides what to send back for each message.
    pub fn spawn<F>(transport: &Arc<MemoryTransport>, topics: Topics, reply: F) -> Self
    where
        F: Fn(&Message) -> Option<Message> + Send + 'static,
    {
        let mut outbox = transport
            .take_outbox()
            .expect("outbox already taken by another remote worker");
        let transport = Arc::clone(transport);
        let (tx, received) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let codec = FragmentCodec::default();
            while let Some(published) = outbox.recv().await {
                if published.topic != topics.events() {
                    continue;
                }
                let Ok(Some(message)) = codec.ingest_payload(&published.payload) else {
                    continue;
                };
                if let Some(response) = reply(&message) {
                    let topic = format!("{}/{}", topics.events(), message.properties.worker_id);
                    for fragment in codec.encode(&response).expect("encode reply") {
                        let payload = fragment.to_payload().expect("fragment payload");
                        transport.inject(&topic, payload);
                    }
                }
                let _ = tx.send(message);
            }
        });

        Self { received, handle }
    }
}

impl Drop for RemoteWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Reassemble every message contained in a publish log.
pub(crate) fn decode_all(published: &[Published]) -> Vec<Message> {
    let codec = FragmentCodec::default();
    published
        .iter()
        .filter_map(|p| codec.ingest_payload(&p.payload).ok().flatten())
        .collect()
}
