//! Core types for the peer mesh

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Session-scoped identifier for a mesh participant.
///
/// A `PeerId` is random and regenerated for every [`Room`](crate::room::Room)
/// instance. It is only used to tag signaling messages so peers can address
/// each other during negotiation. Do not assume it is stable across
/// reconnects, and never use it for peer equality between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer id (16 random bytes, base58-rendered)
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bs58::encode(&bytes).into_string())
    }

    /// Build a peer id from an existing string (e.g. a signaling `from` field)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The string form used on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default cap on simultaneous peer links per room
pub const MAX_CONNECTIONS: usize = 20;
