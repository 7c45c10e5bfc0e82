use std::fmt;

use crc::{Crc, CRC_32_ISCSI};
use xxhash_rust::xxh64::Xxh64;

/// CRC32-C, the default block and WAL checksum.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum algorithm identifier persisted in the table footer.
///
/// Numeric values are part of the on-disk format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumType {
    #[default]
    Crc32c = 1,
    Xxh64 = 4,
}

impl ChecksumType {
    pub fn from_u8(v: u8) -> Option<ChecksumType> {
        match v {
            1 => Some(ChecksumType::Crc32c),
            4 => Some(ChecksumType::Xxh64),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumType::Crc32c => write!(f, "crc32c"),
            ChecksumType::Xxh64 => write!(f, "xxhash64"),
        }
    }
}

/// Computes block-trailer checksums over `block ∥ type_byte`.
#[derive(Clone)]
pub struct Checksummer {
    checksum_type: ChecksumType,
}

impl fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksummer")
            .field("checksum_type", &self.checksum_type)
            .finish()
    }
}

impl Checksummer {
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self { checksum_type }
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    /// Checksums a block body followed by its type byte, the order readers
    /// verify against.
    pub fn checksum(&self, block: &[u8], block_type: u8) -> u32 {
        match self.checksum_type {
            ChecksumType::Crc32c => {
                let mut digest = CRC32C.digest();
                digest.update(block);
                digest.update(&[block_type]);
                digest.finalize()
            }
            ChecksumType::Xxh64 => {
                let mut hasher = Xxh64::new(0);
                hasher.update(block);
                hasher.update(&[block_type]);
                hasher.digest() as u32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_covers_type_byte() {
        let c = Checksummer::new(ChecksumType::Crc32c);
        let a = c.checksum(b"block bytes", 0);
        let b = c.checksum(b"block bytes", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn algorithms_disagree() {
        let crc = Checksummer::new(ChecksumType::Crc32c);
        let xxh = Checksummer::new(ChecksumType::Xxh64);
        assert_ne!(crc.checksum(b"payload", 0), xxh.checksum(b"payload", 0));
    }

    #[test]
    fn crc32c_matches_reference_vector() {
        // "123456789" under CRC-32/ISCSI.
        assert_eq!(CRC32C.checksum(b"123456789"), 0xe306_9283);
    }
}
