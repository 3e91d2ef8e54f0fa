//! Peer Mesh Core Library
//!
//! Peer-to-peer room synchronization and HTTP tunneling for real-time
//! collaborative tools.
//!
//! ## Overview
//!
//! Participants join named rooms through a lightweight signaling relay, open
//! direct peer links to each other and keep a replicated document converged
//! through an opaque two-phase sync handshake. Rooms in the same process skip
//! the network entirely over a broadcast fallback bus. On top of the same
//! message fabric, one peer can share a local HTTP service and every other
//! peer reaches it through a local tunnel listener.
//!
//! - **Transport-agnostic**: peer links are created by a pluggable factory;
//!   negotiation payloads ride the signaling relay
//! - **Collaborator-agnostic**: the document and presence payloads are opaque;
//!   any CRDT library plugs in behind two small traits
//! - **Optional room passwords**: signaling and fallback traffic is encrypted
//!   with a PBKDF2-derived AES-256-GCM key so the relay learns nothing
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use peermesh_core::{
//!     InMemoryDoc, InMemoryPresence, MeshConfig, MeshContext, MeshProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = MeshContext::in_memory();
//!     let doc = Arc::new(InMemoryDoc::new());
//!     let provider = MeshProvider::new(
//!         ctx,
//!         MeshConfig::new("design-review")
//!             .with_url("wss://signaling.example.com")
//!             .with_password("hunter2"),
//!         doc.clone(),
//!         Arc::new(InMemoryPresence::new()),
//!     );
//!
//!     let conn = provider.connect()?;
//!     conn.doc_update(doc.set(b"hello, room")).await;
//!
//!     conn.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod codec;
pub mod collab;
pub mod crypto;
pub mod error;
pub mod events;
pub mod peer;
pub mod provider;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod tunnel;
pub mod types;

// Re-exports
pub use broadcast::BroadcastBus;
pub use codec::Message;
pub use collab::{
    DocumentSync, InMemoryDoc, InMemoryPresence, PresenceSync, SyncOutcome,
};
pub use crypto::{derive_key, CryptoBox};
pub use error::{DecodeError, MeshError, MeshResult};
pub use events::MeshEvent;
pub use peer::PeerLink;
pub use provider::{ConnectionGuard, MeshConfig, MeshContext, MeshProvider};
pub use room::{Room, RoomConfig, RoomRegistry};
pub use signaling::{
    RelayMessage, SignalPayload, SignalSink, SignalingConnection, SignalingRegistry,
};
pub use transport::{
    MemoryTransportFactory, TransportEvent, TransportFactory, TransportHandle, TransportSender,
};
pub use tunnel::{TunnelClient, TunnelRequest, TunnelResponse, TunnelServer};
pub use types::{PeerId, MAX_CONNECTIONS};
