//! Mesh provider: the embedder-facing façade
//!
//! A [`MeshProvider`] joins one named room on behalf of a document/presence
//! collaborator pair. [`MeshProvider::connect`] returns a
//! [`ConnectionGuard`]: dropping it (or calling
//! [`ConnectionGuard::disconnect`]) leaves the room, withdraws from the
//! broadcast fallback and releases the shared signaling connections. There is
//! no process-global state; everything shared lives in an explicit
//! [`MeshContext`] so independent meshes can coexist in one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastBus;
use crate::codec::Message;
use crate::collab::{DocumentSync, PresenceSync};
use crate::error::MeshResult;
use crate::events::MeshEvent;
use crate::room::{Room, RoomConfig, RoomRegistry};
use crate::signaling::{SignalSink, SignalingConnection, SignalingRegistry};
use crate::transport::{MemoryTransportFactory, TransportFactory};
use crate::types::{PeerId, MAX_CONNECTIONS};

/// Shared state for one mesh: open rooms, shared signaling connections, the
/// same-process broadcast bus and the transport factory.
pub struct MeshContext {
    pub rooms: RoomRegistry,
    pub signaling: SignalingRegistry,
    pub bus: Arc<BroadcastBus>,
    pub transport_factory: Arc<dyn TransportFactory>,
}

impl MeshContext {
    pub fn new(bus: Arc<BroadcastBus>, transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RoomRegistry::new(),
            signaling: SignalingRegistry::new(),
            bus,
            transport_factory,
        })
    }

    /// A context wired entirely in-process: fresh bus, memory transports.
    pub fn in_memory() -> Arc<Self> {
        Self::new(
            Arc::new(BroadcastBus::new()),
            Arc::new(MemoryTransportFactory::new()),
        )
    }
}

impl std::fmt::Debug for MeshContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshContext")
            .field("rooms", &self.rooms.len())
            .field("signaling", &self.signaling.len())
            .finish()
    }
}

/// Connection settings for one room.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub room_name: String,
    pub signaling_urls: Vec<String>,
    pub password: Option<String>,
    pub max_conns: usize,
}

impl MeshConfig {
    pub fn new(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            signaling_urls: Vec::new(),
            password: None,
            max_conns: MAX_CONNECTIONS,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_urls.push(url.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }
}

/// Joins rooms on behalf of a collaborator pair.
pub struct MeshProvider {
    ctx: Arc<MeshContext>,
    config: MeshConfig,
    doc: Arc<dyn DocumentSync>,
    presence: Arc<dyn PresenceSync>,
}

impl MeshProvider {
    pub fn new(
        ctx: Arc<MeshContext>,
        config: MeshConfig,
        doc: Arc<dyn DocumentSync>,
        presence: Arc<dyn PresenceSync>,
    ) -> Self {
        Self {
            ctx,
            config,
            doc,
            presence,
        }
    }

    pub fn doc(&self) -> &Arc<dyn DocumentSync> {
        &self.doc
    }

    pub fn presence(&self) -> &Arc<dyn PresenceSync> {
        &self.presence
    }

    /// Join the configured room under a fresh peer id.
    ///
    /// Fails with [`MeshError::DuplicateRoom`](crate::error::MeshError) when
    /// the context already has a live room of this name.
    pub fn connect(&self) -> MeshResult<ConnectionGuard> {
        let peer_id = PeerId::random();
        let room = Room::new(RoomConfig {
            name: self.config.room_name.clone(),
            peer_id: peer_id.clone(),
            password: self.config.password.clone(),
            max_conns: self.config.max_conns,
            doc: self.doc.clone(),
            presence: self.presence.clone(),
            transport_factory: self.ctx.transport_factory.clone(),
        });
        self.ctx.rooms.insert(&room)?;
        room.connect_bus(&self.ctx.bus);

        let mut conns = Vec::with_capacity(self.config.signaling_urls.len());
        for url in &self.config.signaling_urls {
            let conn = self.ctx.signaling.acquire(url);
            let sink: Arc<dyn SignalSink> = conn.clone();
            room.attach_sink(sink);
            conn.register_room(&room);
            conns.push(conn);
        }

        info!(
            room = %self.config.room_name,
            peer_id = %peer_id,
            relays = conns.len(),
            encrypted = self.config.password.is_some(),
            "joined room"
        );
        Ok(ConnectionGuard {
            ctx: self.ctx.clone(),
            room,
            conns,
            released: AtomicBool::new(false),
        })
    }
}

/// A live room membership. Dropping the guard leaves the room.
pub struct ConnectionGuard {
    ctx: Arc<MeshContext>,
    room: Arc<Room>,
    conns: Vec<Arc<SignalingConnection>>,
    released: AtomicBool,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("room", &self.room.name())
            .field("peer_id", self.room.peer_id())
            .finish()
    }
}

impl ConnectionGuard {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn peer_id(&self) -> &PeerId {
        self.room.peer_id()
    }

    pub fn is_synced(&self) -> bool {
        self.room.is_synced()
    }

    /// Subscribe to this room's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.room.subscribe()
    }

    // ---- typed outbound operations ----

    /// Broadcast a document-sync payload (an update or handshake step)
    pub async fn doc_update(&self, payload: Vec<u8>) {
        self.room.broadcast_message(&Message::Sync(payload)).await;
    }

    /// Broadcast the local presence state
    pub async fn presence_update(&self, payload: Vec<u8>) {
        self.room
            .broadcast_message(&Message::Presence(payload))
            .await;
    }

    /// Ask every peer to re-send their presence snapshot
    pub async fn query_presence(&self) {
        self.room.broadcast_message(&Message::QueryPresence).await;
    }

    /// Send a tunneled HTTP request envelope toward whoever shares `port`
    pub async fn client_request(&self, port: u16, data: String) {
        self.room
            .broadcast_message(&Message::TunneledRequest { port, data })
            .await;
    }

    /// Send a tunneled HTTP response envelope back to the requesting side
    pub async fn server_response(&self, port: u16, data: String) {
        self.room
            .broadcast_message(&Message::TunneledResponse { port, data })
            .await;
    }

    /// Tell peers a local service on `port` is now reachable through the mesh
    pub async fn start_sharing_port(&self, port: u16) {
        self.room
            .broadcast_message(&Message::SharePort { port })
            .await;
    }

    /// Ask remote peers to run a command in their container runner
    pub async fn run_remote_command(&self, command: String) {
        self.room
            .broadcast_message(&Message::RunRemoteCommand(command))
            .await;
    }

    /// Broadcast an output chunk from the terminal we share
    pub async fn terminal_output(&self, chunk: String) {
        self.room
            .broadcast_message(&Message::TerminalOutput(chunk))
            .await;
    }

    /// Ask remote peers to start a shared terminal
    pub async fn start_remote_terminal(&self, terminal_id: String) {
        self.room
            .broadcast_message(&Message::StartRemoteTerminal(terminal_id))
            .await;
    }

    /// Send an input line to the remote shared terminal
    pub async fn terminal_command(&self, line: String) {
        self.room
            .broadcast_message(&Message::TerminalCommand(line))
            .await;
    }

    // ---- teardown ----

    fn release_registrations(&self) {
        for conn in &self.conns {
            conn.unregister_room(self.room.name());
            self.ctx.signaling.release(conn.url());
        }
        self.ctx.rooms.remove(self.room.name());
    }

    /// Leave the room in an orderly fashion: presence removal and roster
    /// withdrawal are broadcast before anything is torn down.
    pub async fn disconnect(self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_registrations();
        self.room.disconnect().await;
        debug!(room = %self.room.name(), "connection guard released");
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_registrations();
        // Drop cannot await; finish the room teardown on the runtime when
        // one is still around.
        let room = self.room.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    room.disconnect().await;
                });
            }
            Err(_) => warn!(
                room = %room.name(),
                "guard dropped outside a runtime, skipping orderly room teardown"
            ),
        }
    }
}
