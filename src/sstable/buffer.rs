use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::{Checksummer, ChecksumType};
use crate::compress::{compress, Compression};
use crate::key::InternalKey;
use crate::sstable::block::BlockWriter;
use crate::sstable::collector::BlockPropsEncoder;
use crate::sstable::flush::{should_flush, FlushDecisionOptions};
use crate::sstable::BLOCK_TRAILER_LEN;

/// A block body ready for the file: compressed (or not) and checksummed,
/// with its 5-byte `{type, checksum}` trailer.
#[derive(Debug)]
pub struct PhysicalBlock {
    data: Vec<u8>,
    trailer: [u8; BLOCK_TRAILER_LEN],
}

impl PhysicalBlock {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn trailer(&self) -> &[u8] {
        &self.trailer
    }

    /// Bytes this block occupies in the file, trailer included.
    pub fn len_with_trailer(&self) -> usize {
        self.data.len() + BLOCK_TRAILER_LEN
    }
}

/// Compression scratch and the checksummer, reused across blocks.
pub struct BlockBuf {
    compressed_scratch: Vec<u8>,
    checksummer: Checksummer,
}

impl BlockBuf {
    pub fn new(checksum_type: ChecksumType) -> Self {
        Self {
            compressed_scratch: Vec::new(),
            checksummer: Checksummer::new(checksum_type),
        }
    }

    /// Compresses and checksums a finished block body, producing the
    /// physical block to write.
    pub fn compress_and_checksum(
        &mut self,
        uncompressed: Vec<u8>,
        compression: Compression,
    ) -> PhysicalBlock {
        let (block_type, compressed_len) = {
            let (ty, out) = compress(compression, &uncompressed, &mut self.compressed_scratch);
            (ty, if ty == crate::compress::NO_COMPRESSION_BLOCK_TYPE { None } else { Some(out.len()) })
        };
        let data = match compressed_len {
            Some(len) => {
                let mut taken = std::mem::take(&mut self.compressed_scratch);
                taken.truncate(len);
                taken
            }
            None => uncompressed,
        };
        let mut trailer = [0u8; BLOCK_TRAILER_LEN];
        trailer[0] = block_type;
        let checksum = self.checksummer.checksum(&data, block_type);
        LittleEndian::write_u32(&mut trailer[1..], checksum);
        PhysicalBlock { data, trailer }
    }
}

/// State for one data block in transit through the pipeline. Owned by the
/// producer while it is being filled; handed off whole to the write queue
/// once full, and recycled through the pool after the block is on disk.
pub struct DataBlockBuf {
    pub block: BlockWriter,
    pub block_buf: BlockBuf,
    /// Set once the block is compressed and checksummed.
    pub physical: Option<PhysicalBlock>,
    /// Encoded data-block properties, set when the block is cut.
    pub props: Vec<u8>,
    pub props_encoder: BlockPropsEncoder,
}

impl DataBlockBuf {
    pub fn new(restart_interval: usize, checksum_type: ChecksumType) -> Self {
        Self {
            block: BlockWriter::new(restart_interval),
            block_buf: BlockBuf::new(checksum_type),
            physical: None,
            props: Vec::new(),
            props_encoder: BlockPropsEncoder::default(),
        }
    }

    pub fn should_flush(
        &self,
        key: &InternalKey,
        value_len: usize,
        options: FlushDecisionOptions,
        size_class_hints: &[usize],
    ) -> bool {
        should_flush(
            key.size(),
            value_len,
            self.block.restart_interval(),
            self.block.estimated_size(),
            self.block.n_entries(),
            options,
            size_class_hints,
        )
    }

    /// Finishes the block body and produces the physical block.
    pub fn compress_and_checksum(&mut self, compression: Compression) {
        let uncompressed = self.block.finish();
        self.physical = Some(self.block_buf.compress_and_checksum(uncompressed, compression));
    }

    pub fn clear(&mut self) {
        self.block.clear();
        self.physical = None;
        self.props.clear();
        self.props_encoder.reset_props();
    }
}

/// A free list keyed by buffer role. Buffers come back cleared; a buffer is
/// only returned once the write queue is done with it, which is the
/// ownership handoff boundary.
pub struct BufferPool<T: Send> {
    items: Mutex<Vec<T>>,
}

impl<T: Send> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Option<T> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    pub fn put(&self, item: T) {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push(item);
    }
}

impl<T: Send> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
