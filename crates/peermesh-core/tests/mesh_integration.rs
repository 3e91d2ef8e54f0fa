//! End-to-end mesh tests over an in-process signaling relay
//!
//! The relay here mirrors the real one's semantics (topic pub/sub, delivery
//! to every other subscriber) but dispatches synchronously in-process, so the
//! whole announce/signal/link/handshake pipeline runs without a network.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peermesh_core::{
    InMemoryDoc, InMemoryPresence, MemoryTransportFactory, Message, PeerId, Room, RoomConfig,
    SignalSink, TransportFactory, MAX_CONNECTIONS,
};

/// One in-process relay. Ports publish into it; it fans out to every other
/// port subscribed to the same topic.
#[derive(Default)]
struct RelayHub {
    ports: Mutex<Vec<Arc<RelayPort>>>,
    next_id: Mutex<u64>,
}

struct RelayPort {
    id: u64,
    topic: String,
    hub: Weak<RelayHub>,
    room: Weak<Room>,
}

impl RelayHub {
    fn attach(self: &Arc<Self>, room: &Arc<Room>) -> Arc<RelayPort> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let port = Arc::new(RelayPort {
            id,
            topic: room.name().to_string(),
            hub: Arc::downgrade(self),
            room: Arc::downgrade(room),
        });
        self.ports.lock().push(port.clone());
        room.attach_sink(port.clone());
        port
    }

    fn deliver(&self, from: u64, topic: &str, data: serde_json::Value) {
        let ports: Vec<Arc<RelayPort>> = self.ports.lock().clone();
        for port in ports {
            if port.id == from || port.topic != topic {
                continue;
            }
            if let Some(room) = port.room.upgrade() {
                let sink: Arc<dyn SignalSink> = port.clone();
                room.handle_signaling_data(&sink, data.clone());
            }
        }
    }
}

impl SignalSink for RelayPort {
    fn is_connected(&self) -> bool {
        true
    }
    fn subscribe(&self, _topic: &str) {}
    fn unsubscribe(&self, _topic: &str) {}
    fn publish(&self, topic: &str, data: serde_json::Value) {
        if let Some(hub) = self.hub.upgrade() {
            hub.deliver(self.id, topic, data);
        }
    }
}

fn make_room(
    name: &str,
    password: Option<&str>,
    max_conns: usize,
    factory: &Arc<dyn TransportFactory>,
) -> (Arc<Room>, Arc<InMemoryDoc>) {
    let doc = Arc::new(InMemoryDoc::new());
    let room = Room::new(RoomConfig {
        name: name.to_string(),
        peer_id: PeerId::random(),
        password: password.map(str::to_string),
        max_conns,
        doc: doc.clone(),
        presence: Arc::new(InMemoryPresence::new()),
        transport_factory: factory.clone(),
    });
    (room, doc)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_two_peers_link_handshake_and_converge() {
    let hub = Arc::new(RelayHub::default());
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new());

    let (room_a, doc_a) = make_room("docs", None, MAX_CONNECTIONS, &factory);
    let (room_b, doc_b) = make_room("docs", None, MAX_CONNECTIONS, &factory);
    doc_a.set(b"from a");

    hub.attach(&room_a);
    hub.attach(&room_b);
    room_a.announce_all();

    wait_for("both rooms linked and synced", || {
        room_a.link_peers().len() == 1
            && room_b.link_peers().len() == 1
            && room_a.is_synced()
            && room_b.is_synced()
    })
    .await;

    // The handshake carried A's state over.
    assert_eq!(doc_b.contents(), b"from a");

    // Live updates flow the other way too.
    let update = doc_b.set(b"from b");
    room_b.broadcast_message(&Message::Sync(update)).await;
    wait_for("update from b reaches a", || doc_a.contents() == b"from b").await;
}

#[tokio::test]
async fn test_encrypted_rooms_converge_and_exclude_wrong_password() {
    let hub = Arc::new(RelayHub::default());
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new());

    let (room_a, doc_a) = make_room("vault", Some("correct horse"), MAX_CONNECTIONS, &factory);
    let (room_b, doc_b) = make_room("vault", Some("correct horse"), MAX_CONNECTIONS, &factory);
    let (intruder, intruder_doc) = make_room("vault", Some("wrong"), MAX_CONNECTIONS, &factory);
    doc_a.set(b"member data");

    hub.attach(&room_a);
    hub.attach(&room_b);
    hub.attach(&intruder);

    room_a.announce_all();
    intruder.announce_all();

    wait_for("members linked and synced", || {
        room_a.is_synced() && room_b.is_synced() && doc_b.contents() == b"member data"
    })
    .await;

    // The wrong-password room could not read any announce, so it never links.
    assert!(intruder.link_peers().is_empty());
    assert!(intruder_doc.contents().is_empty());
}

#[tokio::test]
async fn test_announce_cap_limits_link_count() {
    let hub = Arc::new(RelayHub::default());
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new());

    let (capped, _) = make_room("busy", None, 2, &factory);
    hub.attach(&capped);

    let mut others = Vec::new();
    for _ in 0..3 {
        let (room, _) = make_room("busy", None, MAX_CONNECTIONS, &factory);
        hub.attach(&room);
        room.announce_all();
        others.push(room);
    }

    wait_for("capped room has two links", || capped.link_peers().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        capped.link_peers().len(),
        2,
        "third announce must be ignored at the cap"
    );
}

#[tokio::test]
async fn test_disconnect_tears_links_down_on_both_sides() {
    let hub = Arc::new(RelayHub::default());
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new());

    let (room_a, _) = make_room("docs", None, MAX_CONNECTIONS, &factory);
    let (room_b, _) = make_room("docs", None, MAX_CONNECTIONS, &factory);
    hub.attach(&room_a);
    hub.attach(&room_b);
    room_a.announce_all();

    wait_for("rooms linked", || {
        room_a.link_peers().len() == 1 && room_b.link_peers().len() == 1
    })
    .await;

    room_b.disconnect().await;
    wait_for("a saw the link close", || room_a.link_peers().is_empty()).await;
    assert!(room_b.link_peers().is_empty());
}

#[tokio::test]
async fn test_presence_flows_across_links() {
    let hub = Arc::new(RelayHub::default());
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new());

    let presence_a = Arc::new(InMemoryPresence::new());
    presence_a.set_local(b"cursor@1:1".as_slice());
    let room_a = Room::new(RoomConfig {
        name: "docs".to_string(),
        peer_id: PeerId::random(),
        password: None,
        max_conns: MAX_CONNECTIONS,
        doc: Arc::new(InMemoryDoc::new()),
        presence: presence_a,
        transport_factory: factory.clone(),
    });

    let presence_b = Arc::new(InMemoryPresence::new());
    let room_b = Room::new(RoomConfig {
        name: "docs".to_string(),
        peer_id: PeerId::random(),
        password: None,
        max_conns: MAX_CONNECTIONS,
        doc: Arc::new(InMemoryDoc::new()),
        presence: presence_b.clone(),
        transport_factory: factory.clone(),
    });

    hub.attach(&room_a);
    hub.attach(&room_b);
    room_a.announce_all();

    // A sends its presence snapshot at link open.
    wait_for("b received a's presence", || {
        presence_b.last_remote().as_deref() == Some(b"cursor@1:1".as_slice())
    })
    .await;
}
