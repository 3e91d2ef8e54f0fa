//! Room state: the per-document mesh
//!
//! A room ties everything together for one shared document: the set of live
//! [`PeerLink`]s, the same-process broadcast fallback, the room's crypto box
//! and the document/presence collaborators. Messages arriving on any channel
//! funnel through one dispatch path; replies go back on the channel they came
//! in on.
//!
//! Room-wide `synced` is derived, never set directly: it flips to true only
//! when every live link has completed the document handshake, and events are
//! emitted on transitions only.
//!
//! Lock discipline: the parking_lot locks guard plain maps and are never held
//! across an await; the async `send_mux` serializes outgoing room-wide
//! broadcasts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastBus, BusPublisher};
use crate::codec::Message;
use crate::collab::{DocumentSync, PresenceSync};
use crate::crypto::CryptoBox;
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::peer::PeerLink;
use crate::signaling::{SignalPayload, SignalSink};
use crate::transport::TransportFactory;
use crate::types::PeerId;

/// Capacity of the room's event channel
const EVENT_CAPACITY: usize = 256;

/// Where an inbound message came from; replies go back the same way.
enum Origin<'a> {
    Link(&'a Arc<PeerLink>),
    Bus,
}

/// Everything needed to open a room.
pub struct RoomConfig {
    pub name: String,
    pub peer_id: PeerId,
    pub password: Option<String>,
    pub max_conns: usize,
    pub doc: Arc<dyn DocumentSync>,
    pub presence: Arc<dyn PresenceSync>,
    pub transport_factory: Arc<dyn TransportFactory>,
}

/// One joined room.
pub struct Room {
    name: String,
    peer_id: PeerId,
    max_conns: usize,
    crypto: CryptoBox,
    doc: Arc<dyn DocumentSync>,
    presence: Arc<dyn PresenceSync>,
    transport_factory: Arc<dyn TransportFactory>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    bc_peers: Mutex<HashSet<String>>,
    synced: std::sync::atomic::AtomicBool,
    sinks: Mutex<Vec<Arc<dyn SignalSink>>>,
    events: broadcast::Sender<MeshEvent>,
    bus_tx: Mutex<Option<BusPublisher>>,
    bus_task: Mutex<Option<JoinHandle<()>>>,
    send_mux: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("peer_id", &self.peer_id)
            .field("links", &self.links.lock().len())
            .field("bc_peers", &self.bc_peers.lock().len())
            .field("synced", &self.is_synced())
            .finish()
    }
}

impl Room {
    pub fn new(config: RoomConfig) -> Arc<Self> {
        let crypto = CryptoBox::from_password(config.password.as_deref(), &config.name);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            name: config.name,
            peer_id: config.peer_id,
            max_conns: config.max_conns,
            crypto,
            doc: config.doc,
            presence: config.presence,
            transport_factory: config.transport_factory,
            links: Mutex::new(HashMap::new()),
            bc_peers: Mutex::new(HashSet::new()),
            synced: std::sync::atomic::AtomicBool::new(false),
            sinks: Mutex::new(Vec::new()),
            events,
            bus_tx: Mutex::new(None),
            bus_task: Mutex::new(None),
            send_mux: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn doc(&self) -> &Arc<dyn DocumentSync> {
        &self.doc
    }

    pub fn presence(&self) -> &Arc<dyn PresenceSync> {
        &self.presence
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.transport_factory
    }

    /// Whether every live link has completed the document handshake
    pub fn is_synced(&self) -> bool {
        self.synced.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Current direct-link peer ids
    pub fn link_peers(&self) -> Vec<String> {
        self.links.lock().keys().cloned().collect()
    }

    /// Current broadcast-fallback peer ids
    pub fn bc_peers(&self) -> Vec<String> {
        self.bc_peers.lock().iter().cloned().collect()
    }

    /// Subscribe to this room's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Attach a signaling sink this room announces and signals through
    pub fn attach_sink(&self, sink: Arc<dyn SignalSink>) {
        self.sinks.lock().push(sink);
    }

    // ---- same-process broadcast fallback ----

    /// Join the broadcast fallback bus and run the bootstrap exchange so
    /// same-process rooms converge without any signaling round trip.
    pub fn connect_bus(self: &Arc<Self>, bus: &Arc<BroadcastBus>) {
        let (publisher, mut receiver) = bus.subscribe(&self.name);
        *self.bus_tx.lock() = Some(publisher);

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                match weak.upgrade() {
                    Some(room) => room.handle_bus_frame(&frame),
                    None => break,
                }
            }
        });
        *self.bus_task.lock() = Some(task);

        self.publish_bus(&Message::PeerIdAnnounce {
            added: true,
            peer_id: self.peer_id.to_string(),
        });
        self.publish_bus(&Message::Sync(self.doc.sync_step1()));
        self.publish_bus(&Message::Sync(self.doc.sync_step2()));
        self.publish_bus(&Message::QueryPresence);
        if let Some(state) = self.presence.local_state() {
            self.publish_bus(&Message::Presence(state));
        }
    }

    fn publish_bus(&self, msg: &Message) {
        let publisher = self.bus_tx.lock().clone();
        let Some(publisher) = publisher else {
            return;
        };
        match self.crypto.encrypt(&msg.encode()) {
            Ok(frame) => publisher.publish(frame),
            Err(e) => warn!(room = %self.name, error = %e, "bus frame encrypt failed"),
        }
    }

    fn handle_bus_frame(self: &Arc<Self>, frame: &[u8]) {
        let plaintext = match self.crypto.decrypt(frame) {
            Ok(p) => p,
            Err(e) => {
                debug!(room = %self.name, error = %e, "dropping undecryptable bus frame");
                return;
            }
        };
        match Message::decode(&plaintext) {
            Ok(msg) => self.dispatch(Origin::Bus, msg),
            Err(e) => warn!(room = %self.name, error = %e, "dropping malformed bus frame"),
        }
    }

    fn handle_bc_peer(self: &Arc<Self>, added: bool, peer_id: String) {
        if peer_id == self.peer_id.as_str() {
            return;
        }
        let changed = {
            let mut peers = self.bc_peers.lock();
            if added {
                peers.insert(peer_id.clone())
            } else {
                peers.remove(&peer_id)
            }
        };
        if !changed {
            return;
        }
        if added {
            // Re-announce so the newcomer learns our id too.
            self.publish_bus(&Message::PeerIdAnnounce {
                added: true,
                peer_id: self.peer_id.to_string(),
            });
            self.emit_peers(vec![peer_id], vec![]);
        } else {
            self.emit_peers(vec![], vec![peer_id]);
        }
    }

    // ---- signaling ----

    /// Announce ourselves on one sink, inviting links, unless the room is
    /// already at its connection cap.
    pub fn announce_to(self: &Arc<Self>, sink: &Arc<dyn SignalSink>) {
        if self.links.lock().len() >= self.max_conns {
            debug!(room = %self.name, max_conns = self.max_conns, "at cap, not announcing");
            return;
        }
        self.publish_signal(
            sink,
            &SignalPayload::Announce {
                from: self.peer_id.to_string(),
            },
        );
    }

    /// Announce on every connected sink
    pub fn announce_all(self: &Arc<Self>) {
        let sinks: Vec<_> = self.sinks.lock().clone();
        for sink in sinks.iter().filter(|s| s.is_connected()) {
            self.announce_to(sink);
        }
    }

    /// Publish one rendezvous payload on a sink, encrypting it when the room
    /// has a password (the relay then only sees base64 ciphertext).
    pub fn publish_signal(&self, sink: &Arc<dyn SignalSink>, payload: &SignalPayload) {
        if !sink.is_connected() {
            return;
        }
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(room = %self.name, error = %e, "signal payload serialize failed");
                return;
            }
        };
        let data = if self.crypto.is_active() {
            match self.crypto.encrypt_json(&value) {
                Ok(envelope) => serde_json::Value::String(BASE64.encode(envelope)),
                Err(e) => {
                    warn!(room = %self.name, error = %e, "signal payload encrypt failed");
                    return;
                }
            }
        } else {
            value
        };
        sink.publish(&self.name, data);
    }

    fn decode_signal(&self, data: serde_json::Value) -> MeshResult<SignalPayload> {
        let value = if self.crypto.is_active() {
            let encoded = data
                .as_str()
                .ok_or_else(|| MeshError::Signaling("expected base64 ciphertext".to_string()))?;
            let envelope = BASE64
                .decode(encoded)
                .map_err(|e| MeshError::Signaling(format!("bad base64: {e}")))?;
            self.crypto.decrypt_json(&envelope)?
        } else {
            data
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Handle a publish delivered for this room's topic.
    pub fn handle_signaling_data(self: &Arc<Self>, sink: &Arc<dyn SignalSink>, data: serde_json::Value) {
        let payload = match self.decode_signal(data) {
            Ok(p) => p,
            Err(e) => {
                debug!(room = %self.name, error = %e, "dropping unreadable signaling payload");
                return;
            }
        };
        match payload {
            SignalPayload::Announce { from } => self.handle_announce(sink, from),
            SignalPayload::Signal { from, to, signal } => {
                self.handle_signal(sink, from, to, signal)
            }
        }
    }

    fn handle_announce(self: &Arc<Self>, sink: &Arc<dyn SignalSink>, from: String) {
        if from == self.peer_id.as_str() {
            return;
        }
        if self.bc_peers.lock().contains(&from) {
            debug!(room = %self.name, from, "peer is on the local bus, skipping link");
            return;
        }
        {
            let links = self.links.lock();
            if links.contains_key(&from) {
                return;
            }
            if links.len() >= self.max_conns {
                debug!(room = %self.name, from, max_conns = self.max_conns, "at cap, ignoring announce");
                return;
            }
        }
        // The side that hears an announce opens the transport.
        let link = PeerLink::spawn(self, sink.clone(), true, from.clone());
        self.insert_link(link);
    }

    fn handle_signal(
        self: &Arc<Self>,
        sink: &Arc<dyn SignalSink>,
        from: String,
        to: String,
        signal: serde_json::Value,
    ) {
        if to != self.peer_id.as_str() || from == self.peer_id.as_str() {
            return;
        }
        if self.bc_peers.lock().contains(&from) {
            return;
        }
        let existing = self.links.lock().get(&from).cloned();
        let link = match existing {
            Some(link) => link,
            None => {
                // No cap check here: a signal addressed to us means the
                // remote already opened its side after hearing an announce,
                // and the cap only gates announces.
                let link = PeerLink::spawn(self, sink.clone(), false, from.clone());
                self.insert_link(link.clone());
                link
            }
        };
        if let Err(e) = link.signal(signal) {
            warn!(room = %self.name, from, error = %e, "failed to feed signal into transport");
        }
    }

    fn insert_link(&self, link: Arc<PeerLink>) {
        let remote = link.remote_peer_id().to_string();
        self.links.lock().insert(remote.clone(), link);
        self.emit_peers(vec![remote], vec![]);
        // A fresh link is not synced yet.
        self.check_synced();
    }

    /// Drop a dead link, recompute sync state and re-announce so replacements
    /// can form.
    pub(crate) fn remove_link(self: &Arc<Self>, remote: &str) {
        let removed = self.links.lock().remove(remote).is_some();
        if !removed {
            return;
        }
        self.emit_peers(vec![], vec![remote.to_string()]);
        self.check_synced();
        self.announce_all();
    }

    // ---- message dispatch ----

    /// Handle one inbound frame from a peer link. Link frames are not
    /// room-encrypted; the transport provides channel security.
    pub(crate) fn handle_peer_frame(self: &Arc<Self>, link: &Arc<PeerLink>, frame: &[u8]) {
        match Message::decode(frame) {
            Ok(msg) => self.dispatch(Origin::Link(link), msg),
            Err(e) => warn!(
                room = %self.name,
                remote = link.remote_peer_id(),
                error = %e,
                "dropping malformed peer frame"
            ),
        }
    }

    fn dispatch(self: &Arc<Self>, origin: Origin<'_>, msg: Message) {
        match msg {
            Message::Sync(payload) => {
                let outcome = self.doc.handle_sync(&payload);
                if let Some(reply) = outcome.reply {
                    self.reply(&origin, &Message::Sync(reply));
                }
                if outcome.step2_applied {
                    if let Origin::Link(link) = origin {
                        if link.mark_synced() {
                            self.check_synced();
                        }
                    }
                }
            }
            Message::Presence(payload) => self.presence.apply_update(&payload),
            Message::QueryPresence => {
                if let Some(state) = self.presence.local_state() {
                    self.reply(&origin, &Message::Presence(state));
                }
            }
            Message::PeerIdAnnounce { added, peer_id } => match origin {
                Origin::Bus => self.handle_bc_peer(added, peer_id),
                Origin::Link(link) => debug!(
                    room = %self.name,
                    remote = link.remote_peer_id(),
                    "ignoring roster announce on a direct link"
                ),
            },
            Message::TunneledRequest { port, data } => {
                self.emit(MeshEvent::TunneledRequest { port, data })
            }
            Message::TunneledResponse { port, data } => {
                self.emit(MeshEvent::TunneledResponse { port, data })
            }
            Message::SharePort { port } => self.emit(MeshEvent::PortShared { port }),
            Message::RunRemoteCommand(cmd) => self.emit(MeshEvent::RemoteCommand(cmd)),
            Message::TerminalOutput(chunk) => self.emit(MeshEvent::TerminalOutput(chunk)),
            Message::StartRemoteTerminal(id) => self.emit(MeshEvent::StartTerminal(id)),
            Message::TerminalCommand(line) => self.emit(MeshEvent::TerminalCommand(line)),
        }
    }

    fn reply(&self, origin: &Origin<'_>, msg: &Message) {
        match origin {
            Origin::Link(link) => {
                if let Err(e) = link.send_message(msg) {
                    warn!(
                        room = %self.name,
                        remote = link.remote_peer_id(),
                        error = %e,
                        "reply send failed"
                    );
                }
            }
            Origin::Bus => self.publish_bus(msg),
        }
    }

    /// Send one message to every open link and the broadcast fallback.
    pub async fn broadcast_message(self: &Arc<Self>, msg: &Message) {
        let _guard = self.send_mux.lock().await;
        let frame = msg.encode();
        let links: Vec<_> = self.links.lock().values().cloned().collect();
        for link in links.iter().filter(|l| l.is_connected()) {
            if let Err(e) = link.send_frame(frame.clone()) {
                warn!(
                    room = %self.name,
                    remote = link.remote_peer_id(),
                    error = %e,
                    "broadcast send failed"
                );
            }
        }
        self.publish_bus(msg);
    }

    // ---- sync state ----

    /// Recompute room-wide sync state and emit on transition.
    ///
    /// An empty link set counts as synced: an isolated room is converged
    /// with itself. `synced` still starts false and only flips on the first
    /// recompute.
    pub(crate) fn check_synced(&self) {
        let synced = self.links.lock().values().all(|link| link.is_synced());
        let was = self
            .synced
            .swap(synced, std::sync::atomic::Ordering::SeqCst);
        if was != synced {
            info!(room = %self.name, synced, "room sync state changed");
            self.emit(MeshEvent::Synced { synced });
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_peers(&self, added: Vec<String>, removed: Vec<String>) {
        let link_peers = self.link_peers();
        let bc_peers = self.bc_peers();
        self.emit(MeshEvent::Peers {
            added,
            removed,
            link_peers,
            bc_peers,
        });
    }

    // ---- teardown ----

    /// Leave the room: broadcast presence removal, withdraw from the bus and
    /// close every link.
    pub async fn disconnect(self: &Arc<Self>) {
        self.broadcast_message(&Message::Presence(self.presence.removal_state()))
            .await;
        self.publish_bus(&Message::PeerIdAnnounce {
            added: false,
            peer_id: self.peer_id.to_string(),
        });

        if let Some(task) = self.bus_task.lock().take() {
            task.abort();
        }
        *self.bus_tx.lock() = None;
        self.sinks.lock().clear();

        let links: Vec<_> = {
            let mut links = self.links.lock();
            links.drain().map(|(_, link)| link).collect()
        };
        for link in &links {
            link.close();
        }
        if !links.is_empty() {
            let removed = links
                .iter()
                .map(|l| l.remote_peer_id().to_string())
                .collect();
            self.emit_peers(vec![], removed);
        }
        self.synced
            .store(false, std::sync::atomic::Ordering::SeqCst);
        info!(room = %self.name, "room disconnected");
    }
}

/// Injectable registry of open rooms, keyed by room name.
///
/// Holds weak references: a room disappears from lookups once its last owner
/// dropped it, but opening the same name twice while it is alive is an error.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Weak<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened room. Fails if a live room already holds
    /// this name.
    pub fn insert(&self, room: &Arc<Room>) -> MeshResult<()> {
        let mut rooms = self.rooms.lock();
        if let Some(existing) = rooms.get(room.name()) {
            if existing.strong_count() > 0 {
                return Err(MeshError::DuplicateRoom(room.name().to_string()));
            }
        }
        rooms.insert(room.name().to_string(), Arc::downgrade(room));
        Ok(())
    }

    /// Look a live room up by name
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(name).and_then(Weak::upgrade)
    }

    /// Forget a room by name (after disconnect)
    pub fn remove(&self, name: &str) {
        self.rooms.lock().remove(name);
    }

    /// Number of registered names, live or not
    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryDoc, InMemoryPresence};
    use crate::transport::MemoryTransportFactory;

    /// Sink that records publishes instead of talking to a relay.
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl SignalSink for RecordingSink {
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe(&self, _topic: &str) {}
        fn unsubscribe(&self, _topic: &str) {}
        fn publish(&self, topic: &str, data: serde_json::Value) {
            self.published.lock().push((topic.to_string(), data));
        }
    }

    fn test_room(name: &str, peer: &str, password: Option<&str>, max_conns: usize) -> Arc<Room> {
        Room::new(RoomConfig {
            name: name.to_string(),
            peer_id: PeerId::from_string(peer.to_string()),
            password: password.map(str::to_string),
            max_conns,
            doc: Arc::new(InMemoryDoc::new()),
            presence: Arc::new(InMemoryPresence::new()),
            transport_factory: Arc::new(MemoryTransportFactory::new()),
        })
    }

    #[tokio::test]
    async fn test_announce_publishes_plaintext_payload() {
        let room = test_room("docs", "peer-a", None, 20);
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn SignalSink> = recorder.clone();
        room.announce_to(&sink);

        let recorded = recorder.published.lock().clone();
        assert_eq!(recorded.len(), 1);
        let (topic, data) = &recorded[0];
        assert_eq!(topic, "docs");
        assert_eq!(data["type"], "announce");
        assert_eq!(data["from"], "peer-a");
    }

    #[tokio::test]
    async fn test_announce_is_ciphertext_with_password() {
        let room = test_room("docs", "peer-a", Some("hunter2"), 20);
        let recorder = Arc::new(RecordingSink::default());
        let sink: Arc<dyn SignalSink> = recorder.clone();
        room.announce_to(&sink);

        let recorded = recorder.published.lock().clone();
        assert_eq!(recorded.len(), 1);
        let data = &recorded[0].1;
        // The relay must only ever see a base64 string.
        assert!(data.is_string());

        // A same-password room can read it back.
        let envelope = BASE64.decode(data.as_str().unwrap()).unwrap();
        let peer = test_room("docs", "peer-b", Some("hunter2"), 20);
        let value = peer.crypto.decrypt_json(&envelope).unwrap();
        assert_eq!(value["type"], "announce");
    }

    #[tokio::test]
    async fn test_own_announce_is_ignored() {
        let room = test_room("docs", "peer-a", None, 20);
        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());
        room.handle_signaling_data(
            &sink,
            serde_json::json!({"type": "announce", "from": "peer-a"}),
        );
        assert!(room.link_peers().is_empty());
    }

    #[tokio::test]
    async fn test_announce_creates_link_up_to_cap() {
        let room = test_room("docs", "peer-a", None, 2);
        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());

        for peer in ["p1", "p2", "p3"] {
            room.handle_signaling_data(
                &sink,
                serde_json::json!({"type": "announce", "from": peer}),
            );
        }

        let mut peers = room.link_peers();
        peers.sort();
        assert_eq!(peers, vec!["p1", "p2"], "third announce must be dropped at cap");
    }

    #[tokio::test]
    async fn test_addressed_signal_creates_link_even_at_cap() {
        let room = test_room("docs", "peer-a", None, 1);
        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());
        room.handle_signaling_data(
            &sink,
            serde_json::json!({"type": "announce", "from": "p1"}),
        );
        assert_eq!(room.link_peers().len(), 1);

        // p2 heard an earlier announce and initiated toward us; the cap
        // must not refuse the answering side of that negotiation.
        room.handle_signaling_data(
            &sink,
            serde_json::json!({
                "type": "signal",
                "from": "p2",
                "to": "peer-a",
                "signal": {"kind": "offer", "endpoint": 7},
            }),
        );
        let mut peers = room.link_peers();
        peers.sort();
        assert_eq!(peers, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_signal_for_someone_else_is_ignored() {
        let room = test_room("docs", "peer-a", None, 20);
        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());
        room.handle_signaling_data(
            &sink,
            serde_json::json!({
                "type": "signal",
                "from": "p1",
                "to": "someone-else",
                "signal": {"kind": "offer", "endpoint": 1},
            }),
        );
        assert!(room.link_peers().is_empty());
    }

    #[tokio::test]
    async fn test_bus_peer_never_gets_a_link() {
        let room = test_room("docs", "peer-a", None, 20);
        let bus = Arc::new(BroadcastBus::new());
        room.connect_bus(&bus);
        room.handle_bc_peer(true, "local-peer".to_string());
        assert_eq!(room.bc_peers(), vec!["local-peer"]);

        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());
        room.handle_signaling_data(
            &sink,
            serde_json::json!({"type": "announce", "from": "local-peer"}),
        );
        assert!(room.link_peers().is_empty(), "bus peers must not get links");
    }

    #[tokio::test]
    async fn test_synced_starts_false_and_vacuous_recompute_emits_once() {
        let room = test_room("docs", "peer-a", None, 20);
        assert!(!room.is_synced());

        let mut events = room.subscribe();
        room.check_synced();
        assert!(room.is_synced(), "no links means vacuously synced");
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::Synced { synced: true }
        );

        // Second recompute with unchanged state emits nothing.
        room.check_synced();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_undecryptable_signaling_payload_is_dropped() {
        let room = test_room("docs", "peer-a", Some("pw"), 20);
        let sink: Arc<dyn SignalSink> = Arc::new(RecordingSink::default());
        // Plaintext object where ciphertext is expected.
        room.handle_signaling_data(
            &sink,
            serde_json::json!({"type": "announce", "from": "p1"}),
        );
        // Garbage base64 string.
        room.handle_signaling_data(&sink, serde_json::json!("not!!base64"));
        assert!(room.link_peers().is_empty());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_until_dropped() {
        let registry = RoomRegistry::new();
        let room = test_room("docs", "peer-a", None, 20);
        registry.insert(&room).unwrap();

        let twin = test_room("docs", "peer-b", None, 20);
        assert!(matches!(
            registry.insert(&twin),
            Err(MeshError::DuplicateRoom(_))
        ));

        drop(room);
        // The old entry is dead now; reopening the name works.
        registry.insert(&twin).unwrap();
        assert!(registry.get("docs").is_some());

        registry.remove("docs");
        assert!(registry.is_empty());
    }
}
