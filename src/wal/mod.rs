//! Write-ahead-log record framing.
//!
//! Records are fragmented into chunks laid out in fixed 32 KiB physical
//! blocks, so a reader can resynchronize after corruption by seeking to the
//! next block boundary.
//!
//! # Chunk Format
//!
//! ```text
//! +-------------+------------+---------+------------------+
//! | checksum:u32| length:u16 | type:u8 | payload          |
//! +-------------+------------+---------+------------------+
//! |   4 bytes   |  2 bytes   | 1 byte  | length bytes     |
//! +-------------+------------+---------+------------------+
//! ```
//!
//! - Multi-byte header fields are little-endian
//! - The CRC32-C checksum covers the type byte and the payload
//! - A record that fits one block is a single Full chunk; otherwise it is
//!   First, zero or more Middle, then Last
//! - A block tail too small for a header is zero-filled

pub mod metrics;
pub mod queue;
pub mod reader;
pub mod writer;

use crc::{Crc, CRC_32_ISCSI};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Size of a physical WAL block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Size of a chunk header: checksum, length, type.
pub const HEADER_SIZE: usize = 7;

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = BLOCK_SIZE - HEADER_SIZE;

/// Chunk type byte. Zero is reserved so zero-filled block tails are
/// recognizable as padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// A whole record in one chunk.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment(s) of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
}

impl ChunkType {
    pub fn from_u8(v: u8) -> Option<ChunkType> {
        match v {
            1 => Some(ChunkType::Full),
            2 => Some(ChunkType::First),
            3 => Some(ChunkType::Middle),
            4 => Some(ChunkType::Last),
            _ => None,
        }
    }
}

/// Checksum of a chunk: type byte then payload.
pub fn chunk_checksum(chunk_type: ChunkType, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[chunk_type as u8]);
    digest.update(payload);
    digest.finalize()
}
