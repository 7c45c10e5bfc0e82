//! Value separation: large values redirected out of data blocks.
//!
//! A redirected value lives in a dedicated value block; the data-block entry
//! stores a one-byte value prefix followed by an encoded handle locating the
//! value. A terminating value-block index maps block numbers to handles.

use byteorder::{ByteOrder, BigEndian};

use crate::compress::Compression;
use crate::checksum::ChecksumType;
use crate::encoding::{get_varint32, put_varint32};
use crate::error::Result;
use crate::sstable::buffer::BlockBuf;
use crate::sstable::footer::BlockHandle;
use crate::sstable::BLOCK_TRAILER_LEN;

const HANDLE_BIT: u8 = 0x01;
const SAME_PREFIX_BIT: u8 = 0x02;
const ATTRIBUTE_SHIFT: u8 = 2;

/// Builds the prefix byte for an entry whose value was redirected.
pub fn make_prefix_for_value_handle(set_has_same_prefix: bool, attribute: u8) -> u8 {
    HANDLE_BIT | (u8::from(set_has_same_prefix) << 1) | (attribute << ATTRIBUTE_SHIFT)
}

/// Builds the prefix byte for an in-place value.
pub fn make_prefix_for_in_place_value(set_has_same_prefix: bool) -> u8 {
    u8::from(set_has_same_prefix) << 1
}

pub fn prefix_is_value_handle(prefix: u8) -> bool {
    prefix & HANDLE_BIT != 0
}

pub fn prefix_has_same_prefix(prefix: u8) -> bool {
    prefix & SAME_PREFIX_BIT != 0
}

pub fn prefix_attribute(prefix: u8) -> u8 {
    prefix >> ATTRIBUTE_SHIFT
}

/// Locates a redirected value: which value block, where in it, how long.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValueHandle {
    pub value_len: u32,
    pub block_num: u32,
    pub offset_in_block: u32,
}

impl ValueHandle {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_varint32(dst, self.value_len);
        put_varint32(dst, self.block_num);
        put_varint32(dst, self.offset_in_block);
    }

    pub fn decode(buf: &[u8]) -> Result<(ValueHandle, usize)> {
        let (value_len, a) = get_varint32(buf)?;
        let (block_num, b) = get_varint32(&buf[a..])?;
        let (offset_in_block, c) = get_varint32(&buf[a + b..])?;
        Ok((
            ValueHandle {
                value_len,
                block_num,
                offset_in_block,
            },
            a + b + c,
        ))
    }
}

/// Counters surfaced into the properties block.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueBlockStats {
    pub num_value_blocks: u64,
    pub num_values_in_value_blocks: u64,
    /// Size of the value blocks and their index, trailers included.
    pub value_blocks_and_index_size: u64,
}

/// The value blocks and index produced at close, ready to append to the
/// file at the offset passed to `finish`.
pub struct FinishedValueBlocks {
    pub index_handle: Option<BlockHandle>,
    pub stats: ValueBlockStats,
    /// Concatenated value blocks, trailers, and the index block.
    pub bytes: Vec<u8>,
    /// File offset of each written block, for cache invalidation.
    pub block_offsets: Vec<u64>,
}

/// Collects redirected values into value blocks. Finished blocks are
/// compressed and checksummed immediately and buffered in memory until
/// close, reporting each compressed size through `on_block_compressed` so
/// the table size estimate stays accurate.
pub struct ValueBlockWriter {
    block_size: usize,
    compression: Compression,
    block_buf: BlockBuf,
    /// Compressed blocks with trailers, waiting for close.
    finished_blocks: Vec<Vec<u8>>,
    cur_block: Vec<u8>,
    num_values: u64,
    on_block_compressed: Box<dyn Fn(usize) + Send>,
}

impl ValueBlockWriter {
    pub fn new(
        block_size: usize,
        compression: Compression,
        checksum_type: ChecksumType,
        on_block_compressed: Box<dyn Fn(usize) + Send>,
    ) -> Self {
        Self {
            block_size,
            compression,
            block_buf: BlockBuf::new(checksum_type),
            finished_blocks: Vec::new(),
            cur_block: Vec::new(),
            num_values: 0,
            on_block_compressed,
        }
    }

    /// Appends a value, returning the handle to store with the key.
    pub fn add_value(&mut self, value: &[u8]) -> ValueHandle {
        if !self.cur_block.is_empty() && self.cur_block.len() + value.len() > self.block_size {
            self.compress_cur_block();
        }
        let handle = ValueHandle {
            value_len: value.len() as u32,
            block_num: self.finished_blocks.len() as u32,
            offset_in_block: self.cur_block.len() as u32,
        };
        self.cur_block.extend_from_slice(value);
        self.num_values += 1;
        handle
    }

    fn compress_cur_block(&mut self) {
        let block = std::mem::take(&mut self.cur_block);
        let physical = self.block_buf.compress_and_checksum(block, self.compression);
        (self.on_block_compressed)(physical.data().len());
        let mut bytes = Vec::with_capacity(physical.len_with_trailer());
        bytes.extend_from_slice(physical.data());
        bytes.extend_from_slice(physical.trailer());
        self.finished_blocks.push(bytes);
    }

    /// Flushes the trailing block, lays all value blocks out starting at
    /// `file_offset`, and appends the value-block index.
    pub fn finish(&mut self, file_offset: u64) -> FinishedValueBlocks {
        if !self.cur_block.is_empty() {
            self.compress_cur_block();
        }
        if self.finished_blocks.is_empty() {
            return FinishedValueBlocks {
                index_handle: None,
                stats: ValueBlockStats::default(),
                bytes: Vec::new(),
                block_offsets: Vec::new(),
            };
        }

        let mut bytes = Vec::new();
        let mut block_offsets = Vec::with_capacity(self.finished_blocks.len() + 1);
        let mut index = Vec::new();
        for (block_num, block) in self.finished_blocks.iter().enumerate() {
            let offset = file_offset + bytes.len() as u64;
            block_offsets.push(offset);
            // Index entry: fixed-width block number, then the handle of the
            // block body (trailer excluded, like every other handle).
            let mut num = [0u8; 4];
            BigEndian::write_u32(&mut num, block_num as u32);
            index.extend_from_slice(&num);
            BlockHandle {
                offset,
                length: (block.len() - BLOCK_TRAILER_LEN) as u64,
            }
            .encode(&mut index);
            bytes.extend_from_slice(block);
        }

        // The index block is never compressed: it is read eagerly and held
        // decoded.
        let index_offset = file_offset + bytes.len() as u64;
        block_offsets.push(index_offset);
        let physical = self
            .block_buf
            .compress_and_checksum(index, Compression::None);
        let index_handle = BlockHandle {
            offset: index_offset,
            length: physical.data().len() as u64,
        };
        bytes.extend_from_slice(physical.data());
        bytes.extend_from_slice(physical.trailer());

        let stats = ValueBlockStats {
            num_value_blocks: self.finished_blocks.len() as u64,
            num_values_in_value_blocks: self.num_values,
            value_blocks_and_index_size: bytes.len() as u64,
        };
        FinishedValueBlocks {
            index_handle: Some(index_handle),
            stats,
            bytes,
            block_offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(block_size: usize) -> ValueBlockWriter {
        ValueBlockWriter::new(
            block_size,
            Compression::None,
            ChecksumType::Crc32c,
            Box::new(|_| {}),
        )
    }

    #[test]
    fn handles_locate_values_across_blocks() {
        let mut w = writer(16);
        let h1 = w.add_value(b"0123456789");
        let h2 = w.add_value(b"abcde");
        // 15 bytes used; the next value starts a new block.
        let h3 = w.add_value(b"next-block-value");

        assert_eq!(h1, ValueHandle { value_len: 10, block_num: 0, offset_in_block: 0 });
        assert_eq!(h2, ValueHandle { value_len: 5, block_num: 0, offset_in_block: 10 });
        assert_eq!(h3.block_num, 1);
        assert_eq!(h3.offset_in_block, 0);
    }

    #[test]
    fn handle_encoding_roundtrip() {
        let h = ValueHandle {
            value_len: 300,
            block_num: 2,
            offset_in_block: 70_000,
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        let (decoded, n) = ValueHandle::decode(&buf).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn finish_lays_out_blocks_and_index() {
        let mut w = writer(8);
        w.add_value(b"aaaaaaaa");
        w.add_value(b"bbbbbbbb");
        let finished = w.finish(1000);

        let stats = finished.stats;
        assert_eq!(stats.num_value_blocks, 2);
        assert_eq!(stats.num_values_in_value_blocks, 2);
        assert_eq!(stats.value_blocks_and_index_size, finished.bytes.len() as u64);

        let index_handle = finished.index_handle.unwrap();
        assert_eq!(finished.block_offsets.last().copied(), Some(index_handle.offset));
        // First value block sits at the requested file offset.
        assert_eq!(finished.block_offsets[0], 1000);
        assert_eq!(&finished.bytes[..8], b"aaaaaaaa");
    }

    #[test]
    fn empty_writer_finishes_empty() {
        let mut w = writer(8);
        let finished = w.finish(0);
        assert!(finished.index_handle.is_none());
        assert!(finished.bytes.is_empty());
    }

    #[test]
    fn prefix_bits() {
        let p = make_prefix_for_value_handle(true, 3);
        assert!(prefix_is_value_handle(p));
        assert!(prefix_has_same_prefix(p));
        assert_eq!(prefix_attribute(p), 3);

        let p = make_prefix_for_in_place_value(false);
        assert!(!prefix_is_value_handle(p));
        assert!(!prefix_has_same_prefix(p));
    }

    #[test]
    fn compressed_sizes_reported() {
        use std::sync::{Arc, Mutex};
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sizes2 = sizes.clone();
        let mut w = ValueBlockWriter::new(
            8,
            Compression::None,
            ChecksumType::Crc32c,
            Box::new(move |n| sizes2.lock().unwrap().push(n)),
        );
        w.add_value(b"aaaaaaaa");
        w.add_value(b"b");
        w.finish(0);
        assert_eq!(*sizes.lock().unwrap(), vec![8, 1]);
    }
}
