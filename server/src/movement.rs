//! Choosing between delta and absolute position updates.

use shared::codec::{Move, MoveRotate, Rotate};
use shared::position::UNITS_PER_BLOCK;
use shared::{Dimensions, Message, Position};

/// Every Nth update is sent as a full teleport to bound rounding drift.
pub const FULL_UPDATE_PERIOD: u32 = 10;

/// Per-player record of what other clients were last told.
#[derive(Debug, Clone)]
pub struct MovementTracker {
    last_sent: Position,
    updates: u32,
}

impl MovementTracker {
    pub fn new(start: Position) -> Self {
        MovementTracker {
            last_sent: start,
            updates: 0,
        }
    }

    pub fn last_sent(&self) -> Position {
        self.last_sent
    }

    /// The cheapest message that moves entity `id` to `position`, or `None`
    /// when nothing changed.
    pub fn update(&mut self, id: i8, position: Position) -> Option<Message> {
        let delta = position.delta_from(&self.last_sent);
        let rotated = position.rotation_differs(&self.last_sent);
        if delta.is_zero() && !rotated {
            return None;
        }

        self.updates = self.updates.wrapping_add(1);
        self.last_sent = position;

        let full = self.updates % FULL_UPDATE_PERIOD == 0 || !delta.fits_in_byte();
        if full {
            return Some(Message::teleport(id, position));
        }

        let (dx, dy, dz) = delta.as_bytes();
        let message = if delta.is_zero() {
            Message::Rotate(Rotate {
                id,
                yaw: position.yaw,
                pitch: position.pitch,
            })
        } else if !rotated {
            Message::Move(Move { id, dx, dy, dz })
        } else {
            Message::MoveRotate(MoveRotate {
                id,
                dx,
                dy,
                dz,
                yaw: position.yaw,
                pitch: position.pitch,
            })
        };
        Some(message)
    }
}

/// Horizontal position strictly inside the map, height anywhere from the
/// floor up to twice the map height.
pub fn in_bounds(dimensions: Dimensions, position: &Position) -> bool {
    let limit = |blocks: i16| blocks as i32 * UNITS_PER_BLOCK;
    let (x, y, z) = (position.x as i32, position.y as i32, position.z as i32);
    (0..limit(dimensions.x)).contains(&x)
        && (0..limit(dimensions.z)).contains(&z)
        && (0..=2 * limit(dimensions.y)).contains(&y)
}
