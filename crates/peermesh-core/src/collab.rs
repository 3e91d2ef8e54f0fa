//! Boundary traits for the document-sync and presence collaborators
//!
//! The mesh transports a replicated document's two-phase sync handshake and
//! its presence updates without interpreting them. The actual CRDT library
//! lives outside this crate and plugs in through [`DocumentSync`] and
//! [`PresenceSync`]; payloads are opaque byte blobs from the mesh's point of
//! view.
//!
//! The handshake contract mirrors the y-protocols flow:
//!
//! 1. On link open, we send the collaborator's "step 1" (a state digest).
//! 2. A peer answers step 1 with "step 2" (the missing state).
//! 3. Applying step 2 is what flips a link to synced.
//!
//! Everything here is synchronous; the collaborator must tolerate reordering
//! across links (the mesh only guarantees order per link).

use parking_lot::RwLock;

use crate::codec::{Reader, Writer};

/// What the collaborator did with an inbound sync payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// A payload to send back on the same channel, if any
    pub reply: Option<Vec<u8>>,
    /// True when the payload was a "step 2" that was just applied; the link
    /// that delivered it is now synced.
    pub step2_applied: bool,
}

/// The replicated-document collaborator.
///
/// All payloads are opaque: the mesh never looks inside them.
pub trait DocumentSync: Send + Sync {
    /// Encode the "step 1" handshake payload (local state digest)
    fn sync_step1(&self) -> Vec<u8>;

    /// Encode the "step 2" payload (full local state) for the
    /// broadcast-fallback bootstrap
    fn sync_step2(&self) -> Vec<u8>;

    /// Process an inbound sync payload and report what happened
    fn handle_sync(&self, payload: &[u8]) -> SyncOutcome;
}

/// The presence (awareness) collaborator: ephemeral per-user state such as
/// cursors and colors, broadcast but never persisted in the document.
pub trait PresenceSync: Send + Sync {
    /// Snapshot of the local presence state, if any exists yet
    fn local_state(&self) -> Option<Vec<u8>>;

    /// Apply an inbound presence update
    fn apply_update(&self, payload: &[u8]);

    /// Payload announcing that the local participant is leaving
    fn removal_state(&self) -> Vec<u8>;
}

// Payload step markers used by the in-memory reference document.
const STEP1: u64 = 1;
const STEP2: u64 = 2;
const UPDATE: u64 = 3;

/// A minimal last-writer-wins document implementing [`DocumentSync`].
///
/// Not a CRDT: revisions are a plain counter and the higher revision wins.
/// It exists so the mesh can be exercised end to end (and embedded in tools
/// that do not need merging) without pulling in a real replication library.
#[derive(Debug, Default)]
pub struct InMemoryDoc {
    state: RwLock<(u64, Vec<u8>)>,
}

impl InMemoryDoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current document contents
    pub fn contents(&self) -> Vec<u8> {
        self.state.read().1.clone()
    }

    /// Current revision counter
    pub fn revision(&self) -> u64 {
        self.state.read().0
    }

    /// Replace the contents locally and return the update payload to
    /// broadcast to the mesh.
    pub fn set(&self, contents: impl Into<Vec<u8>>) -> Vec<u8> {
        let contents = contents.into();
        let mut state = self.state.write();
        state.0 += 1;
        state.1 = contents.clone();

        let mut w = Writer::new();
        w.write_var_u64(UPDATE);
        w.write_var_u64(state.0);
        w.write_var_bytes(&contents);
        w.into_inner()
    }

    fn encode_state(&self, step: u64) -> Vec<u8> {
        let state = self.state.read();
        let mut w = Writer::new();
        w.write_var_u64(step);
        w.write_var_u64(state.0);
        if step != STEP1 {
            w.write_var_bytes(&state.1);
        }
        w.into_inner()
    }

    /// Adopt remote state if it is newer. Returns true when adopted.
    fn maybe_adopt(&self, rev: u64, contents: &[u8]) -> bool {
        let mut state = self.state.write();
        if rev > state.0 {
            state.0 = rev;
            state.1 = contents.to_vec();
            true
        } else {
            false
        }
    }
}

impl DocumentSync for InMemoryDoc {
    fn sync_step1(&self) -> Vec<u8> {
        self.encode_state(STEP1)
    }

    fn sync_step2(&self) -> Vec<u8> {
        self.encode_state(STEP2)
    }

    fn handle_sync(&self, payload: &[u8]) -> SyncOutcome {
        let mut r = Reader::new(payload);
        let Ok(step) = r.read_var_u64() else {
            return SyncOutcome::default();
        };
        match step {
            STEP1 => {
                // Peer told us their revision; answer with our state.
                SyncOutcome {
                    reply: Some(self.encode_state(STEP2)),
                    step2_applied: false,
                }
            }
            STEP2 => {
                let (Ok(rev), Ok(contents)) = (r.read_var_u64(), r.read_var_bytes()) else {
                    return SyncOutcome::default();
                };
                self.maybe_adopt(rev, contents);
                SyncOutcome {
                    reply: None,
                    step2_applied: true,
                }
            }
            UPDATE => {
                let (Ok(rev), Ok(contents)) = (r.read_var_u64(), r.read_var_bytes()) else {
                    return SyncOutcome::default();
                };
                self.maybe_adopt(rev, contents);
                SyncOutcome::default()
            }
            _ => SyncOutcome::default(),
        }
    }
}

/// In-memory presence store implementing [`PresenceSync`].
#[derive(Debug, Default)]
pub struct InMemoryPresence {
    local: RwLock<Option<Vec<u8>>>,
    last_remote: RwLock<Option<Vec<u8>>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local presence payload (cursor, color, ...)
    pub fn set_local(&self, state: impl Into<Vec<u8>>) {
        *self.local.write() = Some(state.into());
    }

    /// The most recent remote presence payload seen, if any
    pub fn last_remote(&self) -> Option<Vec<u8>> {
        self.last_remote.read().clone()
    }
}

impl PresenceSync for InMemoryPresence {
    fn local_state(&self) -> Option<Vec<u8>> {
        self.local.read().clone()
    }

    fn apply_update(&self, payload: &[u8]) {
        *self.last_remote.write() = Some(payload.to_vec());
    }

    fn removal_state(&self) -> Vec<u8> {
        Vec::new()
    }
}
