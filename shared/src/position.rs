//! Fixed-point entity positions and movement deltas.

use serde::{Deserialize, Serialize};

/// Position units per block edge (5 fractional bits).
pub const UNITS_PER_BLOCK: i32 = 32;
/// Height of the player's eyes above their feet, in position units.
pub const EYE_HEIGHT: i32 = 51;

/// Absolute position and orientation. `y` is the vertical axis; field order
/// matches the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub yaw: u8,
    pub pitch: u8,
}

impl Position {
    pub fn new(x: i16, y: i16, z: i16, yaw: u8, pitch: u8) -> Self {
        Position {
            x,
            y,
            z,
            yaw,
            pitch,
        }
    }

    /// Standing in the centre of a block, eyes at player height.
    pub fn at_block(x: i32, y: i32, z: i32) -> Self {
        let clamp = |value: i32| value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        Position {
            x: clamp(x * UNITS_PER_BLOCK + UNITS_PER_BLOCK / 2),
            y: clamp(y * UNITS_PER_BLOCK + EYE_HEIGHT),
            z: clamp(z * UNITS_PER_BLOCK + UNITS_PER_BLOCK / 2),
            yaw: 0,
            pitch: 0,
        }
    }

    /// Block coordinates containing this position.
    pub fn block(&self) -> (i32, i32, i32) {
        (
            (self.x as i32).div_euclid(UNITS_PER_BLOCK),
            (self.y as i32).div_euclid(UNITS_PER_BLOCK),
            (self.z as i32).div_euclid(UNITS_PER_BLOCK),
        )
    }

    /// Position in fractional block units.
    pub fn to_blocks(&self) -> (f32, f32, f32) {
        let scale = UNITS_PER_BLOCK as f32;
        (
            self.x as f32 / scale,
            self.y as f32 / scale,
            self.z as f32 / scale,
        )
    }

    pub fn delta_from(&self, old: &Position) -> Delta {
        Delta {
            dx: self.x as i32 - old.x as i32,
            dy: self.y as i32 - old.y as i32,
            dz: self.z as i32 - old.z as i32,
        }
    }

    pub fn rotation_differs(&self, old: &Position) -> bool {
        self.yaw != old.yaw || self.pitch != old.pitch
    }

    pub fn with_rotation(self, yaw: u8, pitch: u8) -> Self {
        Position { yaw, pitch, ..self }
    }
}

/// Positional change between two updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delta {
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        self.dx == 0 && self.dy == 0 && self.dz == 0
    }

    /// True when every axis fits the single-byte relative encoding.
    pub fn fits_in_byte(&self) -> bool {
        let fits = |value: i32| (i8::MIN as i32..=i8::MAX as i32).contains(&value);
        fits(self.dx) && fits(self.dy) && fits(self.dz)
    }

    /// Byte-sized components; only meaningful when `fits_in_byte` holds.
    pub fn as_bytes(&self) -> (i8, i8, i8) {
        (self.dx as i8, self.dy as i8, self.dz as i8)
    }
}
