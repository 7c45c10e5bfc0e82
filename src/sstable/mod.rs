//! Sorted-string-table construction.
//!
//! ## Table File Layout
//!
//! ```text
//! +----------------------+
//! | Data Block 1         |
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Data Block N         |
//! +----------------------+
//! | Filter Block         |  (optional)
//! +----------------------+
//! | Index Block(s)       |  (single block, or partitions + top level)
//! +----------------------+
//! | Range-Del Block      |  (optional)
//! +----------------------+
//! | Range-Key Block      |  (optional)
//! +----------------------+
//! | Value Blocks + Index |  (optional)
//! +----------------------+
//! | Properties Block     |
//! +----------------------+
//! | Metaindex Block      |
//! +----------------------+
//! | Footer               |
//! +----------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: a block-type byte (the
//! compression codec actually used) and a 32-bit little-endian checksum of
//! the block body and the type byte.

pub mod block;
pub mod buffer;
pub mod collector;
pub mod estimate;
pub mod flush;
pub mod footer;
pub mod index;
pub mod properties;
pub mod value_block;
pub mod write_queue;
pub mod writer;

use std::fmt;

use crate::error::{Error, Result};

/// Length of the `{type, checksum}` trailer after every block.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Size of the per-entry metadata a block cache attaches to a cached block;
/// added to block sizes when mapping them to allocator size classes.
pub const CACHE_VALUE_METADATA_SIZE: usize = 32;

/// Metaindex key for the range-key block.
pub const META_RANGE_KEY_NAME: &str = "rocksdb.range_key";
/// Metaindex key for the properties block.
pub const META_PROPERTIES_NAME: &str = "rocksdb.properties";
/// Metaindex key for the range-del block, legacy name.
pub const META_RANGE_DEL_NAME: &str = "rangedel";
/// Metaindex key for the range-del block, fragmented-format name.
pub const META_RANGE_DEL_V2_NAME: &str = "rocksdb.range_del";
/// Metaindex key for the value-block index.
pub const META_VALUE_INDEX_NAME: &str = "rocksdb.value_index";

/// Table format versions and their feature gates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum TableFormat {
    /// Block properties.
    V1 = 1,
    /// Range keys.
    V2 = 2,
    /// Value blocks, SetWithDelete.
    V3 = 3,
    /// DeleteSized, in-block obsolete bit, mandatory obsolete collector.
    #[default]
    V4 = 4,
}

impl TableFormat {
    pub fn from_u32(v: u32) -> Option<TableFormat> {
        match v {
            1 => Some(TableFormat::V1),
            2 => Some(TableFormat::V2),
            3 => Some(TableFormat::V3),
            4 => Some(TableFormat::V4),
            _ => None,
        }
    }

    /// Two-level indexes exist in every supported format.
    pub fn supports_two_level_index(self) -> bool {
        true
    }

    pub(crate) fn gate(self, required: TableFormat, feature: &str) -> Result<()> {
        if self < required {
            return Err(Error::FormatTooOld(format!(
                "table format {self} is less than the minimum required version {required} for {feature}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_gates() {
        assert!(TableFormat::V1.gate(TableFormat::V2, "range keys").is_err());
        assert!(TableFormat::V2.gate(TableFormat::V2, "range keys").is_ok());
        assert!(TableFormat::V4.gate(TableFormat::V3, "value blocks").is_ok());
    }
}
