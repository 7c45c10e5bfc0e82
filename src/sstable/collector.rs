//! Block property collectors.
//!
//! Collectors observe the totally ordered key stream on the producer side
//! and produce short per-block, per-index-block, and per-table properties
//! that readers use to skip blocks.

use crate::encoding::{get_varint32, put_varint32};
use crate::error::Result;
use crate::key::InternalKey;

/// Maximum number of collectors per table; the short ID must fit a byte and
/// leave room for future reserved values.
pub const MAX_PROPERTY_COLLECTORS: usize = 128;

/// An injected collector. Calls arrive in strict stream order: `add` for
/// every key, `finish_data_block` when a data block is cut,
/// `add_prev_data_block_to_index_block` once its index entry is decided,
/// `finish_index_block` when an index partition is cut, and `finish_table`
/// exactly once at close.
pub trait BlockPropertyCollector: Send {
    fn name(&self) -> &'static str;

    fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()>;

    /// Appends the property for the data block being cut to `dst`.
    fn finish_data_block(&mut self, dst: &mut Vec<u8>) -> Result<()>;

    /// Folds the last finished data block into the pending index-block
    /// property.
    fn add_prev_data_block_to_index_block(&mut self);

    /// Appends the property for the index block being cut to `dst`.
    fn finish_index_block(&mut self, dst: &mut Vec<u8>) -> Result<()>;

    /// Appends the table-scope property to `dst`.
    fn finish_table(&mut self, dst: &mut Vec<u8>) -> Result<()>;
}

/// Mandatory v4 collector recording whether a block consists entirely of
/// obsolete points, letting readers skip it wholesale.
#[derive(Debug, Default)]
pub struct ObsoleteKeyBlockCollector {
    block_has_point: bool,
    block_all_obsolete: bool,
    index_all_obsolete: bool,
    index_has_block: bool,
    table_all_obsolete: bool,
    table_has_block: bool,
    prev_block_all_obsolete: bool,
}

impl ObsoleteKeyBlockCollector {
    pub const NAME: &'static str = "kiln.internal.obsolete-key";

    /// Called for every point key with its obsolete decision. Range keys do
    /// not participate.
    pub fn add_point(&mut self, is_obsolete: bool) {
        if !self.block_has_point {
            self.block_has_point = true;
            self.block_all_obsolete = true;
        }
        self.block_all_obsolete &= is_obsolete;
    }

    fn encode(all_obsolete: bool, dst: &mut Vec<u8>) {
        // An empty property means "not entirely obsolete", keeping the
        // common case free.
        if all_obsolete {
            dst.push(1);
        }
    }
}

impl BlockPropertyCollector for ObsoleteKeyBlockCollector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add(&mut self, _key: &InternalKey, _value: &[u8]) -> Result<()> {
        // Point keys are fed through add_point by the writer, which has
        // already made the obsolete decision.
        Ok(())
    }

    fn finish_data_block(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        let all = self.block_has_point && self.block_all_obsolete;
        Self::encode(all, dst);
        self.prev_block_all_obsolete = all;
        self.block_has_point = false;
        self.block_all_obsolete = false;
        Ok(())
    }

    fn add_prev_data_block_to_index_block(&mut self) {
        if !self.index_has_block {
            self.index_has_block = true;
            self.index_all_obsolete = true;
        }
        self.index_all_obsolete &= self.prev_block_all_obsolete;
        if !self.table_has_block {
            self.table_has_block = true;
            self.table_all_obsolete = true;
        }
        self.table_all_obsolete &= self.prev_block_all_obsolete;
    }

    fn finish_index_block(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        Self::encode(self.index_has_block && self.index_all_obsolete, dst);
        self.index_has_block = false;
        self.index_all_obsolete = false;
        Ok(())
    }

    fn finish_table(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        Self::encode(self.table_has_block && self.table_all_obsolete, dst);
        Ok(())
    }
}

/// Serializes collector outputs as `(short_id, varint len, bytes)` tuples.
/// The short ID is the collector's position in the writer's collector list.
#[derive(Debug, Default)]
pub struct BlockPropsEncoder {
    buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl BlockPropsEncoder {
    pub fn reset_props(&mut self) {
        self.buf.clear();
    }

    /// Hands out the scratch buffer a collector appends its property into.
    pub fn scratch_for_prop(&mut self) -> Vec<u8> {
        self.scratch.clear();
        std::mem::take(&mut self.scratch)
    }

    pub fn add_prop(&mut self, short_id: u8, prop: Vec<u8>) {
        self.buf.push(short_id);
        put_varint32(&mut self.buf, prop.len() as u32);
        self.buf.extend_from_slice(&prop);
        self.scratch = prop;
    }

    /// The encoded properties; valid until the next reset.
    pub fn unsafe_props(&self) -> &[u8] {
        &self.buf
    }

    /// An owned copy with its own lifetime, safe to store in the writer.
    pub fn props(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// Decodes an encoded property string into `(short_id, bytes)` pairs.
pub fn decode_props(mut buf: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let short_id = buf[0];
        let (len, n) = get_varint32(&buf[1..])?;
        let start = 1 + n;
        out.push((short_id, buf[start..start + len as usize].to_vec()));
        buf = &buf[start + len as usize..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_roundtrip() {
        let mut enc = BlockPropsEncoder::default();
        enc.reset_props();
        enc.add_prop(0, b"abc".to_vec());
        enc.add_prop(1, Vec::new());
        enc.add_prop(2, b"z".to_vec());

        let decoded = decode_props(enc.unsafe_props()).unwrap();
        assert_eq!(
            decoded,
            vec![(0, b"abc".to_vec()), (1, Vec::new()), (2, b"z".to_vec())]
        );
    }

    #[test]
    fn obsolete_collector_marks_fully_obsolete_blocks() {
        let mut c = ObsoleteKeyBlockCollector::default();
        c.add_point(true);
        c.add_point(true);
        let mut prop = Vec::new();
        c.finish_data_block(&mut prop).unwrap();
        assert_eq!(prop, vec![1]);
        c.add_prev_data_block_to_index_block();

        // A block with one live point is not entirely obsolete.
        c.add_point(true);
        c.add_point(false);
        let mut prop = Vec::new();
        c.finish_data_block(&mut prop).unwrap();
        assert!(prop.is_empty());
        c.add_prev_data_block_to_index_block();

        // The index partition contains a live block.
        let mut prop = Vec::new();
        c.finish_index_block(&mut prop).unwrap();
        assert!(prop.is_empty());

        let mut prop = Vec::new();
        c.finish_table(&mut prop).unwrap();
        assert!(prop.is_empty());
    }

    #[test]
    fn empty_block_is_not_obsolete() {
        let mut c = ObsoleteKeyBlockCollector::default();
        let mut prop = Vec::new();
        c.finish_data_block(&mut prop).unwrap();
        assert!(prop.is_empty());
    }
}
