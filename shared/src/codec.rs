//! Byte-exact encoding and decoding of protocol messages.
//!
//! Payloads are plain serde structs run through a fixed-int, big-endian
//! bincode configuration. Fixed-width fields (64-byte strings, 1024-byte level
//! chunks) serialize as tuples, so bincode writes no length prefixes and every
//! payload has exactly the size listed in the opcode table.

use crate::opcode::{Opcode, Side};
use crate::position::Position;
use bincode::Options;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

/// Width of every string field on the wire.
pub const STRING_LEN: usize = 64;
/// Payload capacity of a single level chunk packet.
pub const CHUNK_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("{opcode} cannot be sent by the {side:?}")]
    WrongDirection { opcode: Opcode, side: Side },

    #[error("{opcode} payload must be {expected} bytes, got {actual}")]
    PayloadLength {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

fn wire() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// A fixed number of raw bytes, serialized without a length prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct FixedBytes<const N: usize>(pub [u8; N]);

impl<const N: usize> fmt::Debug for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBytes<{}>", N)
    }
}

impl<const N: usize> Serialize for FixedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in &self.0 {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for BytesVisitor<N> {
            type Value = FixedBytes<N>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "exactly {} bytes", N)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = [0u8; N];
                for (index, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(index, &self))?;
                }
                Ok(FixedBytes(out))
            }
        }

        deserializer.deserialize_tuple(N, BytesVisitor::<N>)
    }
}

/// A 64-byte, space-padded ASCII string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaddedString(FixedBytes<STRING_LEN>);

impl PaddedString {
    /// Pads with spaces, truncating anything past 64 bytes. Characters outside
    /// ASCII become `?`.
    pub fn new(text: &str) -> Self {
        let mut buf = [b' '; STRING_LEN];
        for (slot, ch) in buf.iter_mut().zip(text.chars()) {
            *slot = if ch.is_ascii() { ch as u8 } else { b'?' };
        }
        PaddedString(FixedBytes(buf))
    }

    /// Decodes bytes one-to-one and trims surrounding whitespace.
    pub fn to_text(&self) -> String {
        let raw: String = self.0 .0.iter().map(|&byte| byte as char).collect();
        raw.trim().to_string()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0 .0
    }
}

impl fmt::Debug for PaddedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_text())
    }
}

impl From<&str> for PaddedString {
    fn from(text: &str) -> Self {
        PaddedString::new(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u8,
    pub name: PaddedString,
    pub verification_key: PaddedString,
    pub unused: u8,
}

/// The server's reply to a handshake; shares opcode 0x00.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerIdentification {
    pub protocol_version: u8,
    pub server_name: PaddedString,
    pub motd: PaddedString,
    pub user_type: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelChunk {
    pub length: i16,
    pub data: FixedBytes<CHUNK_LEN>,
    pub progress: u8,
}

impl LevelChunk {
    pub fn payload(&self) -> &[u8] {
        let len = (self.length.max(0) as usize).min(CHUNK_LEN);
        &self.data.0[..len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelEnd {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBlockRequest {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub mode: u8,
    pub block: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBlock {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub block: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddEntity {
    pub id: i8,
    pub name: PaddedString,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teleport {
    pub id: i8,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRotate {
    pub id: i8,
    pub dx: i8,
    pub dy: i8,
    pub dz: i8,
    pub yaw: u8,
    pub pitch: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub id: i8,
    pub dx: i8,
    pub dy: i8,
    pub dz: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotate {
    pub id: i8,
    pub yaw: u8,
    pub pitch: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i8,
    pub text: PaddedString,
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    ServerIdentification(ServerIdentification),
    Ping,
    LevelBegin,
    LevelChunk(LevelChunk),
    LevelEnd(LevelEnd),
    SetBlockRequest(SetBlockRequest),
    SetBlock(SetBlock),
    AddEntity(AddEntity),
    Teleport(Teleport),
    MoveRotate(MoveRotate),
    Move(Move),
    Rotate(Rotate),
    RemoveEntity { id: i8 },
    Chat(ChatMessage),
    Kick { reason: PaddedString },
    SetPermission { user_type: u8 },
}

impl Message {
    pub fn chat(text: &str) -> Self {
        Message::Chat(ChatMessage {
            id: 0,
            text: PaddedString::new(text),
        })
    }

    pub fn kick(reason: &str) -> Self {
        Message::Kick {
            reason: PaddedString::new(reason),
        }
    }

    pub fn teleport(id: i8, position: Position) -> Self {
        Message::Teleport(Teleport { id, position })
    }

    pub fn add_entity(id: i8, name: &str, position: Position) -> Self {
        Message::AddEntity(AddEntity {
            id,
            name: PaddedString::new(name),
            position,
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Handshake(_) | Message::ServerIdentification(_) => Opcode::Handshake,
            Message::Ping => Opcode::Ping,
            Message::LevelBegin => Opcode::LevelBegin,
            Message::LevelChunk(_) => Opcode::LevelChunk,
            Message::LevelEnd(_) => Opcode::LevelEnd,
            Message::SetBlockRequest(_) => Opcode::SetBlockClient,
            Message::SetBlock(_) => Opcode::SetBlockServer,
            Message::AddEntity(_) => Opcode::AddEntity,
            Message::Teleport(_) => Opcode::Teleport,
            Message::MoveRotate(_) => Opcode::MoveRotate,
            Message::Move(_) => Opcode::Move,
            Message::Rotate(_) => Opcode::Rotate,
            Message::RemoveEntity { .. } => Opcode::RemoveEntity,
            Message::Chat(_) => Opcode::Message,
            Message::Kick { .. } => Opcode::Kick,
            Message::SetPermission { .. } => Opcode::SetPermission,
        }
    }

    /// Encodes the opcode byte followed by the fixed-size payload.
    pub fn encode(&self) -> Result<Packet, CodecError> {
        let opcode = self.opcode();
        let mut buf = Vec::with_capacity(1 + opcode.payload_len());
        buf.push(opcode.as_byte());

        let options = wire();
        match self {
            Message::Handshake(body) => options.serialize_into(&mut buf, body)?,
            Message::ServerIdentification(body) => options.serialize_into(&mut buf, body)?,
            Message::Ping | Message::LevelBegin => {}
            Message::LevelChunk(body) => options.serialize_into(&mut buf, body)?,
            Message::LevelEnd(body) => options.serialize_into(&mut buf, body)?,
            Message::SetBlockRequest(body) => options.serialize_into(&mut buf, body)?,
            Message::SetBlock(body) => options.serialize_into(&mut buf, body)?,
            Message::AddEntity(body) => options.serialize_into(&mut buf, body)?,
            Message::Teleport(body) => options.serialize_into(&mut buf, body)?,
            Message::MoveRotate(body) => options.serialize_into(&mut buf, body)?,
            Message::Move(body) => options.serialize_into(&mut buf, body)?,
            Message::Rotate(body) => options.serialize_into(&mut buf, body)?,
            Message::RemoveEntity { id } => options.serialize_into(&mut buf, id)?,
            Message::Chat(body) => options.serialize_into(&mut buf, body)?,
            Message::Kick { reason } => options.serialize_into(&mut buf, reason)?,
            Message::SetPermission { user_type } => options.serialize_into(&mut buf, user_type)?,
        }

        debug_assert_eq!(buf.len(), 1 + opcode.payload_len());
        Ok(Packet::from_vec(buf))
    }

    /// Decodes a payload whose opcode has already been read.
    pub fn decode(opcode: Opcode, payload: &[u8], sender: Side) -> Result<Self, CodecError> {
        if !opcode.sent_by(sender) {
            return Err(CodecError::WrongDirection {
                opcode,
                side: sender,
            });
        }
        if payload.len() != opcode.payload_len() {
            return Err(CodecError::PayloadLength {
                opcode,
                expected: opcode.payload_len(),
                actual: payload.len(),
            });
        }

        let options = wire();
        let message = match opcode {
            Opcode::Handshake => match sender {
                Side::Client => Message::Handshake(options.deserialize(payload)?),
                Side::Server => Message::ServerIdentification(options.deserialize(payload)?),
            },
            Opcode::Ping => Message::Ping,
            Opcode::LevelBegin => Message::LevelBegin,
            Opcode::LevelChunk => Message::LevelChunk(options.deserialize(payload)?),
            Opcode::LevelEnd => Message::LevelEnd(options.deserialize(payload)?),
            Opcode::SetBlockClient => Message::SetBlockRequest(options.deserialize(payload)?),
            Opcode::SetBlockServer => Message::SetBlock(options.deserialize(payload)?),
            Opcode::AddEntity => Message::AddEntity(options.deserialize(payload)?),
            Opcode::Teleport => Message::Teleport(options.deserialize(payload)?),
            Opcode::MoveRotate => Message::MoveRotate(options.deserialize(payload)?),
            Opcode::Move => Message::Move(options.deserialize(payload)?),
            Opcode::Rotate => Message::Rotate(options.deserialize(payload)?),
            Opcode::RemoveEntity => Message::RemoveEntity {
                id: options.deserialize(payload)?,
            },
            Opcode::Message => Message::Chat(options.deserialize(payload)?),
            Opcode::Kick => Message::Kick {
                reason: options.deserialize(payload)?,
            },
            Opcode::SetPermission => Message::SetPermission {
                user_type: options.deserialize(payload)?,
            },
        };
        Ok(message)
    }

    /// Reads one complete message from a blocking reader.
    pub fn read_from<R: Read>(reader: &mut R, sender: Side) -> Result<Self, CodecError> {
        let mut opcode = [0u8; 1];
        reader.read_exact(&mut opcode)?;
        let opcode = Opcode::from_byte(opcode[0]).ok_or(CodecError::UnknownOpcode(opcode[0]))?;

        let mut payload = vec![0u8; opcode.payload_len()];
        reader.read_exact(&mut payload)?;
        Message::decode(opcode, &payload, sender)
    }
}

/// An encoded, immutable wire message. Cloning shares the buffer, so one
/// packet can be fanned out to many sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Arc<[u8]>,
}

impl Packet {
    fn from_vec(bytes: Vec<u8>) -> Self {
        Packet {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.bytes.first().copied().and_then(Opcode::from_byte)
    }

    /// Disconnect-class packets end the sender's service cycle.
    pub fn is_disconnect(&self) -> bool {
        self.opcode() == Some(Opcode::Kick)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(opcode) => write!(f, "Packet({}, {} bytes)", opcode, self.len()),
            None => write!(f, "Packet(invalid, {} bytes)", self.len()),
        }
    }
}
