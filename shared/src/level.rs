//! Level transfer: gzip framing and the begin/chunk/end sub-protocol.
//!
//! The block array is prefixed with its length as a big-endian `u32`, gzipped,
//! and streamed in chunks of up to 1024 bytes. Each chunk carries the share of
//! the compressed stream delivered so far, so the final chunk reports 100.

use crate::codec::{FixedBytes, LevelChunk, LevelEnd, Message, CHUNK_LEN};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum LevelError {
    #[error("level data is corrupt: {0}")]
    Corrupt(#[from] io::Error),

    #[error("level declares {declared} blocks but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("level is {actual} blocks but dimensions need {expected}")]
    WrongVolume { expected: usize, actual: usize },

    #[error("level chunk received before level start")]
    NotStarted,
}

/// Map size in blocks; `y` is the vertical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Dimensions {
    pub fn new(x: i16, y: i16, z: i16) -> Self {
        Dimensions { x, y, z }
    }

    pub fn volume(&self) -> usize {
        self.x.max(0) as usize * self.y.max(0) as usize * self.z.max(0) as usize
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        (0..self.x as i32).contains(&x)
            && (0..self.y as i32).contains(&y)
            && (0..self.z as i32).contains(&z)
    }

    /// Index into the block array, or `None` when out of bounds.
    pub fn index(&self, x: i32, y: i32, z: i32) -> Option<usize> {
        if !self.contains(x, y, z) {
            return None;
        }
        Some(((y as usize * self.z as usize) + z as usize) * self.x as usize + x as usize)
    }
}

impl From<LevelEnd> for Dimensions {
    fn from(end: LevelEnd) -> Self {
        Dimensions::new(end.x, end.y, end.z)
    }
}

pub fn compress(blocks: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&(blocks.len() as u32).to_be_bytes())?;
    encoder.write_all(blocks)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, LevelError> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    if decoded.len() < 4 {
        return Err(LevelError::LengthMismatch {
            declared: 4,
            actual: decoded.len(),
        });
    }

    let declared = u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]) as usize;
    let blocks = decoded.split_off(4);
    if blocks.len() != declared {
        return Err(LevelError::LengthMismatch {
            declared,
            actual: blocks.len(),
        });
    }
    Ok(blocks)
}

/// Splits compressed level data into chunk messages.
pub fn chunks(compressed: &[u8]) -> Vec<Message> {
    let total = compressed.len().max(1);
    let mut sent = 0;
    compressed
        .chunks(CHUNK_LEN)
        .map(|piece| {
            sent += piece.len();
            let mut data = [0u8; CHUNK_LEN];
            data[..piece.len()].copy_from_slice(piece);
            Message::LevelChunk(LevelChunk {
                length: piece.len() as i16,
                data: FixedBytes(data),
                progress: (100 * sent / total) as u8,
            })
        })
        .collect()
}

/// The complete begin, chunks, end sequence for a level.
pub fn transfer(blocks: &[u8], dimensions: Dimensions) -> Result<Vec<Message>, LevelError> {
    if blocks.len() != dimensions.volume() {
        return Err(LevelError::WrongVolume {
            expected: dimensions.volume(),
            actual: blocks.len(),
        });
    }

    let compressed = compress(blocks)?;
    let mut messages = Vec::with_capacity(compressed.len() / CHUNK_LEN + 3);
    messages.push(Message::LevelBegin);
    messages.extend(chunks(&compressed));
    messages.push(Message::LevelEnd(LevelEnd {
        x: dimensions.x,
        y: dimensions.y,
        z: dimensions.z,
    }));
    Ok(messages)
}

/// Client-side reassembly of a level transfer.
#[derive(Debug, Default)]
pub struct LevelAssembler {
    buffer: Option<Vec<u8>>,
    progress: u8,
}

impl LevelAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.buffer = Some(Vec::new());
        self.progress = 0;
    }

    pub fn push(&mut self, chunk: &LevelChunk) -> Result<u8, LevelError> {
        let buffer = self.buffer.as_mut().ok_or(LevelError::NotStarted)?;
        buffer.extend_from_slice(chunk.payload());
        self.progress = chunk.progress;
        Ok(self.progress)
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Decompresses the received data and checks it against the dimensions.
    pub fn finish(&mut self, end: LevelEnd) -> Result<(Dimensions, Vec<u8>), LevelError> {
        let buffer = self.buffer.take().ok_or(LevelError::NotStarted)?;
        let dimensions = Dimensions::from(end);
        let blocks = decompress(&buffer)?;
        if blocks.len() != dimensions.volume() {
            return Err(LevelError::WrongVolume {
                expected: dimensions.volume(),
                actual: blocks.len(),
            });
        }
        Ok((dimensions, blocks))
    }
}
