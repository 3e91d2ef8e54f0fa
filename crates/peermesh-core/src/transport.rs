//! Peer transport boundary
//!
//! The mesh does not do NAT traversal itself. A [`PeerLink`](crate::peer::PeerLink)
//! owns exactly one transport instance obtained from a [`TransportFactory`];
//! negotiation payloads produced by the transport are ferried through the
//! signaling relay, and frames only flow once the transport reports
//! [`TransportEvent::Open`]. The frame channel is assumed ordered and
//! reliable.
//!
//! [`MemoryTransportFactory`] is the in-process implementation: it performs a
//! one-round offer/answer negotiation through the same signal plumbing a real
//! ICE transport would use, then bridges frames over channels. It backs the
//! integration tests and same-host sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};

/// Events surfaced by a transport to its owning peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Negotiation payload that must be relayed to the remote peer through
    /// signaling (the `signal` message)
    Signal(serde_json::Value),
    /// The data channel is open; frames may now flow
    Open,
    /// An ordered frame from the remote peer
    Data(Vec<u8>),
    /// A non-fatal transport error; the transport owns the authoritative
    /// close signal
    Error(String),
    /// The transport closed; the link is dead and will not be resurrected
    Closed,
}

/// Commands accepted by a transport.
#[derive(Debug)]
enum TransportCmd {
    Send(Vec<u8>),
    Signal(serde_json::Value),
    Close,
}

/// Cloneable command half of a transport.
#[derive(Debug, Clone)]
pub struct TransportSender {
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
}

impl TransportSender {
    /// Send one frame to the remote peer
    pub fn send(&self, frame: Vec<u8>) -> MeshResult<()> {
        self.cmd_tx
            .send(TransportCmd::Send(frame))
            .map_err(|_| MeshError::Transport("transport task gone".to_string()))
    }

    /// Feed an inbound negotiation payload (received via signaling) into the
    /// transport
    pub fn signal(&self, payload: serde_json::Value) -> MeshResult<()> {
        self.cmd_tx
            .send(TransportCmd::Signal(payload))
            .map_err(|_| MeshError::Transport("transport task gone".to_string()))
    }

    /// Tear the transport down. Idempotent.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Close);
    }
}

/// Event half of a transport. Polled by a single task.
#[derive(Debug)]
pub struct TransportEvents {
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportEvents {
    /// Next transport event, or `None` once the transport task is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }
}

/// A freshly created, not-yet-negotiated transport.
#[derive(Debug)]
pub struct TransportHandle {
    pub sender: TransportSender,
    pub events: TransportEvents,
}

/// Creates one transport per peer link.
pub trait TransportFactory: Send + Sync {
    /// Create a transport. `initiator` decides which side opens negotiation:
    /// the initiator emits the first `Signal` event unprompted.
    fn create(&self, initiator: bool) -> TransportHandle;
}

// In-memory frames carried between endpoints of the hub.
#[derive(Debug)]
enum HubFrame {
    Data(Vec<u8>),
    Close,
}

#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<u64, mpsc::UnboundedSender<HubFrame>>>,
    next_id: Mutex<u64>,
}

impl Hub {
    fn register(&self) -> (u64, mpsc::UnboundedReceiver<HubFrame>) {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = *next;
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().insert(id, tx);
        (id, rx)
    }

    fn deliver(&self, to: u64, frame: HubFrame) -> bool {
        match self.endpoints.lock().get(&to) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn deregister(&self, id: u64) {
        self.endpoints.lock().remove(&id);
    }
}

/// In-process transport factory. Clones share one hub, so transports created
/// by any clone can reach each other once their signals are exchanged.
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    hub: Arc<Hub>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, initiator: bool) -> TransportHandle {
        let hub = self.hub.clone();
        let (endpoint_id, mut hub_rx) = hub.register();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut remote: Option<u64> = None;

            if initiator {
                let offer = serde_json::json!({ "kind": "offer", "endpoint": endpoint_id });
                let _ = event_tx.send(TransportEvent::Signal(offer));
            }

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TransportCmd::Signal(payload)) => {
                            let kind = payload.get("kind").and_then(|v| v.as_str());
                            let peer = payload.get("endpoint").and_then(|v| v.as_u64());
                            match (kind, peer) {
                                (Some("offer"), Some(peer)) => {
                                    remote = Some(peer);
                                    let answer = serde_json::json!({
                                        "kind": "answer",
                                        "endpoint": endpoint_id,
                                    });
                                    let _ = event_tx.send(TransportEvent::Signal(answer));
                                    let _ = event_tx.send(TransportEvent::Open);
                                }
                                (Some("answer"), Some(peer)) => {
                                    remote = Some(peer);
                                    let _ = event_tx.send(TransportEvent::Open);
                                }
                                _ => {
                                    warn!(?payload, "memory transport: unusable signal");
                                    let _ = event_tx.send(TransportEvent::Error(
                                        "unusable signal payload".to_string(),
                                    ));
                                }
                            }
                        }
                        Some(TransportCmd::Send(frame)) => {
                            let delivered = remote
                                .map(|peer| hub.deliver(peer, HubFrame::Data(frame)))
                                .unwrap_or(false);
                            if !delivered {
                                let _ = event_tx.send(TransportEvent::Error(
                                    "send before open or after remote close".to_string(),
                                ));
                            }
                        }
                        Some(TransportCmd::Close) | None => {
                            if let Some(peer) = remote {
                                hub.deliver(peer, HubFrame::Close);
                            }
                            hub.deregister(endpoint_id);
                            let _ = event_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                    frame = hub_rx.recv() => match frame {
                        Some(HubFrame::Data(data)) => {
                            let _ = event_tx.send(TransportEvent::Data(data));
                        }
                        Some(HubFrame::Close) | None => {
                            hub.deregister(endpoint_id);
                            let _ = event_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                }
            }
            debug!(endpoint_id, "memory transport task ended");
        });

        TransportHandle {
            sender: TransportSender { cmd_tx },
            events: TransportEvents { event_rx },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive negotiation between two handles by ferrying Signal events,
    /// like the signaling relay would.
    async fn negotiate(a: &mut TransportHandle, b: &mut TransportHandle) {
        let offer = match a.events.recv().await {
            Some(TransportEvent::Signal(payload)) => payload,
            other => panic!("expected offer, got {:?}", other),
        };
        b.sender.signal(offer).unwrap();

        let answer = match b.events.recv().await {
            Some(TransportEvent::Signal(payload)) => payload,
            other => panic!("expected answer, got {:?}", other),
        };
        assert_eq!(b.events.recv().await, Some(TransportEvent::Open));

        a.sender.signal(answer).unwrap();
        assert_eq!(a.events.recv().await, Some(TransportEvent::Open));
    }

    #[tokio::test]
    async fn test_offer_answer_then_frames_flow_both_ways() {
        let factory = MemoryTransportFactory::new();
        let mut a = factory.create(true);
        let mut b = factory.create(false);
        negotiate(&mut a, &mut b).await;

        a.sender.send(b"ping".to_vec()).unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(TransportEvent::Data(b"ping".to_vec()))
        );

        b.sender.send(b"pong".to_vec()).unwrap();
        assert_eq!(
            a.events.recv().await,
            Some(TransportEvent::Data(b"pong".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_close_reaches_the_remote_side() {
        let factory = MemoryTransportFactory::new();
        let mut a = factory.create(true);
        let mut b = factory.create(false);
        negotiate(&mut a, &mut b).await;

        a.sender.close();
        assert_eq!(a.events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(b.events.recv().await, Some(TransportEvent::Closed));
    }

    #[tokio::test]
    async fn test_send_before_open_is_an_error_event() {
        let factory = MemoryTransportFactory::new();
        let mut a = factory.create(true);
        // Skip the offer event.
        let _ = a.events.recv().await;

        a.sender.send(b"too early".to_vec()).unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_factories_must_share_a_hub() {
        let f1 = MemoryTransportFactory::new();
        let f2 = f1.clone();
        let mut a = f1.create(true);
        let mut b = f2.create(false);
        negotiate(&mut a, &mut b).await;
        a.sender.send(b"cross-clone".to_vec()).unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(TransportEvent::Data(b"cross-clone".to_vec()))
        );
    }
}
