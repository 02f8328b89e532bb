//! Protocol types shared by the server and the headless client.
//!
//! Covers the classic block-world protocol (version 7): the opcode table, the
//! byte-exact message codec, positions, chat wrapping, level transfer and
//! name verification.

pub mod chat;
pub mod codec;
pub mod level;
pub mod opcode;
pub mod position;
pub mod verify;

pub use codec::{CodecError, Message, Packet, PaddedString};
pub use level::Dimensions;
pub use opcode::{Opcode, Side};
pub use position::{Delta, Position};

pub const PROTOCOL_VERSION: u8 = 7;

/// Entity id a client uses to refer to itself.
pub const SELF_ID: i8 = -1;

/// User type values carried in the identification and permission packets.
pub const USER_TYPE_NORMAL: u8 = 0x00;
pub const USER_TYPE_OP: u8 = 0x64;

/// Highest block type a client may place.
pub const MAX_BLOCK: u8 = 49;

pub fn is_valid_block(block: u8) -> bool {
    block <= MAX_BLOCK
}
