//! Binary wire codec for peer-link messages
//!
//! Every frame exchanged on a peer link or the broadcast fallback is a tagged
//! message: a varint type tag followed by type-specific fields. Numbers use
//! unsigned LEB128 varints, strings and byte arrays are varint-length-prefixed
//! and ports are fixed-width little-endian u16, the same layout the y-webrtc
//! family of providers puts on the wire, so tags must stay stable within a
//! deployment.
//!
//! Decoding is total: a malformed or unknown message yields a
//! [`DecodeError`](crate::error::DecodeError) that the caller logs and drops.
//! Unknown trailing bytes after a known payload are ignored for forward
//! compatibility.

use crate::error::DecodeError;

/// Tag values for each message kind. Stable wire contract.
pub mod tag {
    pub const SYNC: u64 = 0;
    pub const PRESENCE: u64 = 1;
    pub const QUERY_PRESENCE: u64 = 3;
    pub const PEER_ID_ANNOUNCE: u64 = 4;
    pub const TUNNELED_REQUEST: u64 = 5;
    pub const TUNNELED_RESPONSE: u64 = 6;
    pub const SHARE_PORT: u64 = 7;
    pub const RUN_REMOTE_COMMAND: u64 = 8;
    pub const TERMINAL_OUTPUT: u64 = 9;
    pub const START_REMOTE_TERMINAL: u64 = 10;
    pub const TERMINAL_COMMAND: u64 = 11;
}

/// A message on a peer link or the broadcast fallback.
///
/// `Sync` and `Presence` carry opaque payloads owned by the document-sync
/// collaborator; this core transports them without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Document-sync handshake/update payload. Consumes the rest of the
    /// frame, matching the reference wire layout where the sync protocol
    /// reads directly from the stream.
    Sync(Vec<u8>),
    /// Presence (awareness) update payload
    Presence(Vec<u8>),
    /// Ask peers to reply with their presence snapshot
    QueryPresence,
    /// Broadcast-fallback roster change: a peer id appeared or withdrew
    PeerIdAnnounce {
        /// true = peer joined the fallback channel, false = withdrew
        added: bool,
        /// The announcing peer's session id
        peer_id: String,
    },
    /// Tunneled HTTP request envelope addressed by shared port
    TunneledRequest { port: u16, data: String },
    /// Tunneled HTTP response envelope addressed by shared port
    TunneledResponse { port: u16, data: String },
    /// A peer started sharing a local service on this port
    SharePort { port: u16 },
    /// Ask the remote side to run a command in its container runner
    RunRemoteCommand(String),
    /// Output chunk from a shared terminal
    TerminalOutput(String),
    /// Ask the remote side to start a shared terminal
    StartRemoteTerminal(String),
    /// Input line for a shared terminal
    TerminalCommand(String),
}

impl Message {
    /// The wire tag for this message
    pub fn tag(&self) -> u64 {
        match self {
            Message::Sync(_) => tag::SYNC,
            Message::Presence(_) => tag::PRESENCE,
            Message::QueryPresence => tag::QUERY_PRESENCE,
            Message::PeerIdAnnounce { .. } => tag::PEER_ID_ANNOUNCE,
            Message::TunneledRequest { .. } => tag::TUNNELED_REQUEST,
            Message::TunneledResponse { .. } => tag::TUNNELED_RESPONSE,
            Message::SharePort { .. } => tag::SHARE_PORT,
            Message::RunRemoteCommand(_) => tag::RUN_REMOTE_COMMAND,
            Message::TerminalOutput(_) => tag::TERMINAL_OUTPUT,
            Message::StartRemoteTerminal(_) => tag::START_REMOTE_TERMINAL,
            Message::TerminalCommand(_) => tag::TERMINAL_COMMAND,
        }
    }

    /// Encode this message to its wire representation
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_var_u64(self.tag());
        match self {
            Message::Sync(payload) => w.write_raw(payload),
            Message::Presence(payload) => w.write_var_bytes(payload),
            Message::QueryPresence => {}
            Message::PeerIdAnnounce { added, peer_id } => {
                w.write_u8(u8::from(*added));
                w.write_var_string(peer_id);
            }
            Message::TunneledRequest { port, data } | Message::TunneledResponse { port, data } => {
                w.write_u16(*port);
                w.write_var_string(data);
            }
            Message::SharePort { port } => w.write_u16(*port),
            Message::RunRemoteCommand(s)
            | Message::TerminalOutput(s)
            | Message::StartRemoteTerminal(s)
            | Message::TerminalCommand(s) => w.write_var_string(s),
        }
        w.into_inner()
    }

    /// Decode a message from its wire representation.
    ///
    /// Unknown tags yield [`DecodeError::UnknownType`]; trailing bytes after
    /// a complete payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let tag = r.read_var_u64()?;
        let msg = match tag {
            tag::SYNC => Message::Sync(r.read_rest().to_vec()),
            tag::PRESENCE => Message::Presence(r.read_var_bytes()?.to_vec()),
            tag::QUERY_PRESENCE => Message::QueryPresence,
            tag::PEER_ID_ANNOUNCE => Message::PeerIdAnnounce {
                added: r.read_u8()? == 1,
                peer_id: r.read_var_string()?,
            },
            tag::TUNNELED_REQUEST => Message::TunneledRequest {
                port: r.read_u16()?,
                data: r.read_var_string()?,
            },
            tag::TUNNELED_RESPONSE => Message::TunneledResponse {
                port: r.read_u16()?,
                data: r.read_var_string()?,
            },
            tag::SHARE_PORT => Message::SharePort { port: r.read_u16()? },
            tag::RUN_REMOTE_COMMAND => Message::RunRemoteCommand(r.read_var_string()?),
            tag::TERMINAL_OUTPUT => Message::TerminalOutput(r.read_var_string()?),
            tag::START_REMOTE_TERMINAL => Message::StartRemoteTerminal(r.read_var_string()?),
            tag::TERMINAL_COMMAND => Message::TerminalCommand(r.read_var_string()?),
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(msg)
    }
}

/// Append-only wire writer over a byte buffer
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Take the encoded bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Little-endian fixed-width u16 (port fields)
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Unsigned LEB128 varint
    pub fn write_var_u64(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Varint-length-prefixed byte array
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Varint-length-prefixed UTF-8 string
    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    /// Unprefixed raw bytes (rest-of-frame payloads)
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Cursor-based wire reader
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow(self.pos - 1));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow(self.pos - 1));
            }
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_var_u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// All bytes not yet consumed
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Bytes remaining in the buffer
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_variants() -> Vec<Message> {
        vec![
            Message::Sync(vec![0, 1, 2, 0xff]),
            Message::Presence(vec![9, 9, 9]),
            Message::QueryPresence,
            Message::PeerIdAnnounce {
                added: true,
                peer_id: "peer-a".to_string(),
            },
            Message::PeerIdAnnounce {
                added: false,
                peer_id: "peer-b".to_string(),
            },
            Message::TunneledRequest {
                port: 8080,
                data: "{\"method\":\"GET\"}".to_string(),
            },
            Message::TunneledResponse {
                port: 8080,
                data: "{\"status\":200}".to_string(),
            },
            Message::SharePort { port: 3000 },
            Message::RunRemoteCommand("docker run app".to_string()),
            Message::TerminalOutput("$ ls\n".to_string()),
            Message::StartRemoteTerminal("bash".to_string()),
            Message::TerminalCommand("echo hi".to_string()),
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for msg in all_variants() {
            let encoded = msg.encode();
            let decoded = Message::decode(&encoded).unwrap();
            assert_eq!(decoded, msg, "round trip failed for tag {}", msg.tag());
        }
    }

    #[test]
    fn test_unknown_tag_is_an_error_not_a_panic() {
        let mut w = Writer::new();
        w.write_var_u64(99);
        w.write_var_string("whatever");
        let err = Message::decode(&w.into_inner()).unwrap_err();
        assert_eq!(err, DecodeError::UnknownType(99));
    }

    #[test]
    fn test_empty_buffer_is_eof() {
        let err = Message::decode(&[]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof(_)));
    }

    #[test]
    fn test_truncated_string_is_eof() {
        let mut w = Writer::new();
        w.write_var_u64(tag::RUN_REMOTE_COMMAND);
        w.write_var_u64(100); // claims 100 bytes
        w.write_raw(b"short");
        let err = Message::decode(&w.into_inner()).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof(_)));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut encoded = Message::SharePort { port: 8080 }.encode();
        encoded.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, Message::SharePort { port: 8080 });
    }

    #[test]
    fn test_invalid_utf8_string_is_rejected() {
        let mut w = Writer::new();
        w.write_var_u64(tag::TERMINAL_COMMAND);
        w.write_var_bytes(&[0xff, 0xfe, 0xfd]);
        let err = Message::decode(&w.into_inner()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8);
    }

    #[test]
    fn test_sync_consumes_rest_of_frame() {
        // No length prefix on Sync payloads; the handshake owns the remainder.
        let msg = Message::Sync(vec![1, 2, 3]);
        let encoded = msg.encode();
        assert_eq!(encoded, vec![0, 1, 2, 3]);
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_varint_boundary_values() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            let mut w = Writer::new();
            w.write_var_u64(v);
            let bytes = w.into_inner();
            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_var_u64().unwrap(), v);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn test_port_is_little_endian_fixed_width() {
        let encoded = Message::SharePort { port: 0x1234 }.encode();
        assert_eq!(encoded, vec![tag::SHARE_PORT as u8, 0x34, 0x12]);
    }

    proptest! {
        #[test]
        fn prop_varint_round_trip(v in any::<u64>()) {
            let mut w = Writer::new();
            w.write_var_u64(v);
            let bytes = w.into_inner();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.read_var_u64().unwrap(), v);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            // Arbitrary garbage must produce a value or an error, never a panic.
            let _ = Message::decode(&bytes);
        }
    }
}
