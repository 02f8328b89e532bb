//! Opcode table for the classic block-world protocol.
//!
//! Every packet starts with one opcode byte. There is no length prefix, so the
//! size of each payload is fixed and must be known from the opcode (and, for
//! the few opcodes whose layout differs by direction, from the sender).

use std::fmt;

/// Which side of the connection produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0x00,
    Ping = 0x01,
    LevelBegin = 0x02,
    LevelChunk = 0x03,
    LevelEnd = 0x04,
    SetBlockClient = 0x05,
    SetBlockServer = 0x06,
    AddEntity = 0x07,
    Teleport = 0x08,
    MoveRotate = 0x09,
    Move = 0x0a,
    Rotate = 0x0b,
    RemoveEntity = 0x0c,
    Message = 0x0d,
    Kick = 0x0e,
    SetPermission = 0x0f,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let opcode = match byte {
            0x00 => Opcode::Handshake,
            0x01 => Opcode::Ping,
            0x02 => Opcode::LevelBegin,
            0x03 => Opcode::LevelChunk,
            0x04 => Opcode::LevelEnd,
            0x05 => Opcode::SetBlockClient,
            0x06 => Opcode::SetBlockServer,
            0x07 => Opcode::AddEntity,
            0x08 => Opcode::Teleport,
            0x09 => Opcode::MoveRotate,
            0x0a => Opcode::Move,
            0x0b => Opcode::Rotate,
            0x0c => Opcode::RemoveEntity,
            0x0d => Opcode::Message,
            0x0e => Opcode::Kick,
            0x0f => Opcode::SetPermission,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Payload size in bytes, not counting the opcode itself.
    pub fn payload_len(self) -> usize {
        match self {
            Opcode::Handshake => 130,
            Opcode::Ping => 0,
            Opcode::LevelBegin => 0,
            Opcode::LevelChunk => 1027,
            Opcode::LevelEnd => 6,
            Opcode::SetBlockClient => 8,
            Opcode::SetBlockServer => 7,
            Opcode::AddEntity => 73,
            Opcode::Teleport => 9,
            Opcode::MoveRotate => 6,
            Opcode::Move => 4,
            Opcode::Rotate => 3,
            Opcode::RemoveEntity => 1,
            Opcode::Message => 65,
            Opcode::Kick => 64,
            Opcode::SetPermission => 1,
        }
    }

    /// Whether `side` is allowed to send this opcode at all.
    pub fn sent_by(self, side: Side) -> bool {
        match side {
            Side::Client => matches!(
                self,
                Opcode::Handshake | Opcode::SetBlockClient | Opcode::Teleport | Opcode::Message
            ),
            Side::Server => self != Opcode::SetBlockClient,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02x})", self, self.as_byte())
    }
}
