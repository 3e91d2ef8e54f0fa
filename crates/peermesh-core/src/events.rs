//! Mesh events delivered to external collaborators
//!
//! The reference provider dispatched on stringly event names; here every
//! consumer matches on one closed enum, so adding a message kind is a
//! compile-time-checked change everywhere it matters.
//!
//! Events fan out over a `tokio::sync::broadcast` channel owned by the
//! [`MeshProvider`](crate::provider::MeshProvider); the tunnel, container
//! runner and terminal layers each subscribe and pick out their variants.

/// Events emitted by a mesh provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Room-wide sync state flipped. Emitted only on transitions; `synced`
    /// is true iff every live peer link finished the document handshake.
    Synced { synced: bool },

    /// The peer roster changed.
    Peers {
        /// Peer ids that appeared in this change
        added: Vec<String>,
        /// Peer ids that went away in this change
        removed: Vec<String>,
        /// Current direct-link peers
        link_peers: Vec<String>,
        /// Current broadcast-fallback peers
        bc_peers: Vec<String>,
    },

    /// A tunneled HTTP request arrived for a service we share on `port`
    TunneledRequest { port: u16, data: String },

    /// A tunneled HTTP response arrived for a request we sent to `port`
    TunneledResponse { port: u16, data: String },

    /// A remote peer started sharing a service on `port`
    PortShared { port: u16 },

    /// A remote peer asked us to run a command in the container runner
    RemoteCommand(String),

    /// Output chunk from a remote shared terminal
    TerminalOutput(String),

    /// A remote peer asked us to start a shared terminal
    StartTerminal(String),

    /// Input line for the terminal we share
    TerminalCommand(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_comparable() {
        assert_eq!(
            MeshEvent::Synced { synced: true },
            MeshEvent::Synced { synced: true }
        );
        assert_ne!(
            MeshEvent::PortShared { port: 80 },
            MeshEvent::PortShared { port: 8080 }
        );
    }
}
