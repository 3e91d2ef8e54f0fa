//! One direct link to a remote peer
//!
//! A [`PeerLink`] owns a transport created by the room's
//! [`TransportFactory`](crate::transport::TransportFactory) and runs its event
//! loop: ferrying negotiation payloads through signaling, opening the
//! document-sync handshake once the channel is up, and handing inbound frames
//! to the room.
//!
//! Links are never resurrected. When the transport closes the link removes
//! itself from the room and the room re-announces so a fresh link can form.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::codec::Message;
use crate::error::MeshResult;
use crate::room::Room;
use crate::signaling::{SignalPayload, SignalSink};
use crate::transport::{TransportEvent, TransportSender};

/// A single peer-to-peer link inside a room.
pub struct PeerLink {
    remote_peer_id: String,
    initiator: bool,
    sender: TransportSender,
    connected: AtomicBool,
    synced: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_peer_id", &self.remote_peer_id)
            .field("initiator", &self.initiator)
            .field("connected", &self.is_connected())
            .field("synced", &self.is_synced())
            .finish()
    }
}

impl PeerLink {
    /// Create the transport and start the link's event loop.
    ///
    /// The initiator side produces the first negotiation payload unprompted;
    /// the other side only reacts to inbound signals.
    pub fn spawn(
        room: &Arc<Room>,
        sink: Arc<dyn SignalSink>,
        initiator: bool,
        remote_peer_id: String,
    ) -> Arc<Self> {
        let handle = room.transport_factory().create(initiator);
        let link = Arc::new(Self {
            remote_peer_id,
            initiator,
            sender: handle.sender,
            connected: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        debug!(
            room = room.name(),
            remote = link.remote_peer_id,
            initiator,
            "peer link created"
        );

        let weak_room = Arc::downgrade(room);
        tokio::spawn(Self::run(weak_room, sink, link.clone(), handle.events));
        link
    }

    async fn run(
        weak_room: Weak<Room>,
        sink: Arc<dyn SignalSink>,
        link: Arc<PeerLink>,
        mut events: crate::transport::TransportEvents,
    ) {
        loop {
            let Some(event) = events.recv().await else {
                break;
            };
            let Some(room) = weak_room.upgrade() else {
                link.close();
                return;
            };

            match event {
                TransportEvent::Signal(signal) => {
                    room.publish_signal(
                        &sink,
                        &SignalPayload::Signal {
                            from: room.peer_id().to_string(),
                            to: link.remote_peer_id.clone(),
                            signal,
                        },
                    );
                }
                TransportEvent::Open => {
                    link.connected.store(true, Ordering::SeqCst);
                    debug!(
                        room = room.name(),
                        remote = link.remote_peer_id,
                        "peer link open"
                    );
                    if let Err(e) = link.send_message(&Message::Sync(room.doc().sync_step1())) {
                        warn!(remote = link.remote_peer_id, error = %e, "handshake send failed");
                    }
                    if let Some(state) = room.presence().local_state() {
                        let _ = link.send_message(&Message::Presence(state));
                    }
                }
                TransportEvent::Data(frame) => {
                    room.handle_peer_frame(&link, &frame);
                }
                TransportEvent::Error(reason) => {
                    warn!(
                        room = room.name(),
                        remote = link.remote_peer_id,
                        reason,
                        "peer link error"
                    );
                    // Let other subscribers retry a connection to us.
                    room.announce_all();
                }
                TransportEvent::Closed => {
                    break;
                }
            }
        }

        link.closed.store(true, Ordering::SeqCst);
        link.connected.store(false, Ordering::SeqCst);
        if let Some(room) = weak_room.upgrade() {
            debug!(
                room = room.name(),
                remote = link.remote_peer_id,
                "peer link closed"
            );
            room.remove_link(&link.remote_peer_id);
        }
    }

    /// The remote peer's session id
    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    /// Whether this side opened the negotiation
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// True once the transport reported open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once the document handshake completed on this link
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// True once the transport closed; the link will not come back
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record handshake completion. Returns true on the first call.
    pub(crate) fn mark_synced(&self) -> bool {
        !self.synced.swap(true, Ordering::SeqCst)
    }

    /// Encode and send one message over this link
    pub fn send_message(&self, msg: &Message) -> MeshResult<()> {
        self.sender.send(msg.encode())
    }

    /// Send a pre-encoded frame over this link
    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> MeshResult<()> {
        self.sender.send(frame)
    }

    /// Feed an inbound negotiation payload into the transport
    pub(crate) fn signal(&self, payload: serde_json::Value) -> MeshResult<()> {
        self.sender.signal(payload)
    }

    /// Close the underlying transport. Idempotent.
    pub fn close(&self) {
        self.sender.close();
    }
}
