//! Same-origin broadcast fallback
//!
//! Rooms in the same process exchange traffic over this bus instead of going
//! through signaling and a peer transport. It is the analogue of the
//! browser's BroadcastChannel: topic-keyed, delivery to every subscriber
//! except the publisher, no ordering guarantees relative to peer links.
//!
//! Frames on the bus are already encrypted by the room's
//! [`CryptoBox`](crate::crypto::CryptoBox); the bus itself moves opaque bytes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of each topic's broadcast channel
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct BusFrame {
    origin: u64,
    payload: Vec<u8>,
}

/// Process-wide topic bus. Injectable: tests create isolated instances so
/// independent meshes never cross-contaminate.
#[derive(Default)]
pub struct BroadcastBus {
    topics: Mutex<HashMap<String, broadcast::Sender<BusFrame>>>,
    next_origin: Mutex<u64>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. Returns a publisher and a receiver bound to the
    /// same origin id, so the subscriber never hears its own frames.
    /// Dropping the receiver is the unsubscribe.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> (BusPublisher, BusReceiver) {
        let origin = {
            let mut next = self.next_origin.lock();
            *next += 1;
            *next
        };
        let sender = {
            let mut topics = self.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .clone()
        };
        debug!(topic, origin, "subscribed to broadcast fallback");
        let rx = sender.subscribe();
        (
            BusPublisher {
                topic: topic.to_string(),
                origin,
                sender,
            },
            BusReceiver { origin, rx },
        )
    }

    /// Drop topics nobody listens to anymore
    pub fn gc(&self) {
        self.topics.lock().retain(|_, tx| tx.receiver_count() > 0);
    }
}

/// Publishing half of a bus subscription.
#[derive(Debug, Clone)]
pub struct BusPublisher {
    topic: String,
    origin: u64,
    sender: broadcast::Sender<BusFrame>,
}

impl BusPublisher {
    /// Publish a frame to every other subscriber of the topic.
    /// A topic with no listeners is not an error.
    pub fn publish(&self, payload: Vec<u8>) {
        let _ = self.sender.send(BusFrame {
            origin: self.origin,
            payload,
        });
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Receiving half of a bus subscription. Polled by a single task.
#[derive(Debug)]
pub struct BusReceiver {
    origin: u64,
    rx: broadcast::Receiver<BusFrame>,
}

impl BusReceiver {
    /// Next frame from another subscriber, or `None` when the topic is gone.
    /// Own frames are filtered out; lagging skips to the oldest retained
    /// frame with a warning.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.origin == self.origin => continue,
                Ok(frame) => return Some(frame.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast fallback receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
