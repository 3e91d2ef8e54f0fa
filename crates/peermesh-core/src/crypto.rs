//! Room encryption using password-derived AES-256-GCM keys
//!
//! Rooms opened with a password encrypt all signaling payloads and
//! broadcast-fallback frames. The key is derived with PBKDF2-HMAC-SHA256
//! (100k iterations, salt = room name) so that every participant who knows
//! the password independently arrives at the same key.
//!
//! ## Wire Format
//!
//! Encrypted envelope: `varstring "AES-GCM" | var-bytes iv (12) | var-bytes ciphertext+tag`
//!
//! Without a password the box is a pass-through: bytes go out exactly as they
//! came in. Ciphertext and plaintext are not distinguishable by inspection,
//! so whether a room is encrypted is tracked per room, never guessed from the
//! wire.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::codec::{Reader, Writer};
use crate::error::{MeshError, MeshResult};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM iv size in bytes
pub const IV_SIZE: usize = 12;

/// PBKDF2 iteration count for key derivation
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Algorithm label carried in every encrypted envelope
const ALGORITHM: &str = "AES-GCM";

/// Derive a room key from a shared password.
///
/// PBKDF2-HMAC-SHA256 with the room name as salt. Deterministic: the same
/// password and room name always produce the same key.
pub fn derive_key(secret: &str, room_name: &str) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        secret.as_bytes(),
        room_name.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}

/// Symmetric encryption for room traffic, or a pass-through when the room
/// has no password.
#[derive(Clone)]
pub struct CryptoBox {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox")
            .field("active", &self.is_active())
            .finish()
    }
}

impl CryptoBox {
    /// Create a box around an existing key, or a pass-through for `None`
    pub fn new(key: Option<&[u8; KEY_SIZE]>) -> Self {
        Self {
            cipher: key.map(|k| Aes256Gcm::new(k.into())),
        }
    }

    /// Derive the key from an optional password. `None` gives a pass-through.
    pub fn from_password(password: Option<&str>, room_name: &str) -> Self {
        match password {
            Some(secret) => {
                let key = derive_key(secret, room_name);
                Self::new(Some(&key))
            }
            None => Self::new(None),
        }
    }

    /// Whether encryption is active for this room
    pub fn is_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a payload, or return it unchanged when no key is set.
    pub fn encrypt(&self, plaintext: &[u8]) -> MeshResult<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };

        let mut iv = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| MeshError::EncryptFailed(e.to_string()))?;

        let mut w = Writer::new();
        w.write_var_string(ALGORITHM);
        w.write_var_bytes(&iv);
        w.write_var_bytes(&ciphertext);
        Ok(w.into_inner())
    }

    /// Decrypt an envelope, or return the bytes unchanged when no key is set.
    ///
    /// Failure means a wrong key, tampering or a malformed envelope; the
    /// caller drops the message.
    pub fn decrypt(&self, data: &[u8]) -> MeshResult<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };

        let mut r = Reader::new(data);
        let algorithm = r
            .read_var_string()
            .map_err(|e| MeshError::DecryptFailed(e.to_string()))?;
        if algorithm != ALGORITHM {
            return Err(MeshError::UnknownAlgorithm(algorithm));
        }
        let iv = r
            .read_var_bytes()
            .map_err(|e| MeshError::DecryptFailed(e.to_string()))?;
        if iv.len() != IV_SIZE {
            return Err(MeshError::DecryptFailed(format!(
                "iv length {} (want {})",
                iv.len(),
                IV_SIZE
            )));
        }
        let ciphertext = r
            .read_var_bytes()
            .map_err(|e| MeshError::DecryptFailed(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| MeshError::DecryptFailed(e.to_string()))
    }

    /// Encrypt a JSON value (signaling payloads)
    pub fn encrypt_json(&self, value: &serde_json::Value) -> MeshResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(&plaintext)
    }

    /// Decrypt back into a JSON value (signaling payloads)
    pub fn decrypt_json(&self, data: &[u8]) -> MeshResult<serde_json::Value> {
        let plaintext = self.decrypt(data)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
