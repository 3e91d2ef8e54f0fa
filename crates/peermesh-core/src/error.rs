//! Error types for the peer mesh engine

use thiserror::Error;

/// Main error type for mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// A room with the same name is already open in this context
    #[error("A room named \"{0}\" is already open")]
    DuplicateRoom(String),

    /// Room was not found in the registry
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Wire message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    /// Decryption failed (wrong key, tampered data, or malformed input).
    /// Callers treat this as a dropped message, never as fatal.
    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    /// Envelope named an encryption algorithm we do not speak
    #[error("Unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Error on the signaling relay connection
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Peer transport negotiation or delivery failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON (de)serialization error on the signaling or tunnel path
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tunnel proxying failed; converted into a synthetic 500 response
    /// before it ever crosses the mesh
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to decode a wire message.
///
/// Decode errors never cross a connection boundary: the offending message is
/// logged and dropped, and the read loop keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Message carried a tag we do not know
    #[error("Unknown message type tag: {0}")]
    UnknownType(u64),

    /// Message ended before a complete payload could be read
    #[error("Unexpected end of message at offset {0}")]
    UnexpectedEof(usize),

    /// Varint was longer than 64 bits
    #[error("Varint overflow at offset {0}")]
    VarintOverflow(usize),

    /// A length-prefixed string was not valid UTF-8
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::DuplicateRoom("demo".to_string());
        assert_eq!(format!("{}", err), "A room named \"demo\" is already open");
    }

    #[test]
    fn test_decode_error_converts() {
        let err: MeshError = DecodeError::UnknownType(99).into();
        assert!(matches!(
            err,
            MeshError::Decode(DecodeError::UnknownType(99))
        ));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MeshError = io_err.into();
        assert!(matches!(err, MeshError::Io(_)));
    }
}
