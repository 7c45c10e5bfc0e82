use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::ChecksumType;
use crate::encoding::{get_varint64, put_varint64, MAX_VARINT64_LEN};
use crate::error::{Error, Result};
use crate::sstable::TableFormat;

/// Magic number at the end of every table file ("kilnsst", version 1).
pub const TABLE_MAGIC: u64 = 0x6b69_6c6e_7373_7401;

/// Fixed footer length: checksum-type byte, two padded block handles, the
/// format version, and the magic.
pub const FOOTER_LEN: usize = 1 + 2 * MAX_BLOCK_HANDLE_LEN + 4 + 8;

/// Maximum encoded length of a block handle.
pub const MAX_BLOCK_HANDLE_LEN: usize = 2 * MAX_VARINT64_LEN;

/// Estimated encoded size of a `BlockHandleWithProperties`, used as the
/// inflight size of an index entry before the real handle exists. The
/// property bytes are not included; this is an estimate.
pub const ENCODED_BHP_ESTIMATED_SIZE: usize = MAX_BLOCK_HANDLE_LEN;

/// Locates a block within the file: offset and length, excluding the
/// 5-byte trailer that follows the block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.length);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(MAX_BLOCK_HANDLE_LEN);
        self.encode(&mut dst);
        dst
    }

    /// Decodes a handle from the front of `buf`, returning it and the bytes
    /// consumed.
    pub fn decode(buf: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n) = get_varint64(buf)?;
        let (length, m) = get_varint64(&buf[n..])?;
        Ok((BlockHandle { offset, length }, n + m))
    }
}

/// A block handle plus the encoded per-block properties stored in index
/// entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockHandleWithProperties {
    pub handle: BlockHandle,
    pub props: Vec<u8>,
}

impl BlockHandleWithProperties {
    pub fn encoded(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(MAX_BLOCK_HANDLE_LEN + self.props.len());
        self.handle.encode(&mut dst);
        dst.extend_from_slice(&self.props);
        dst
    }

    pub fn decode(buf: &[u8]) -> Result<BlockHandleWithProperties> {
        let (handle, n) = BlockHandle::decode(buf)?;
        Ok(BlockHandleWithProperties {
            handle,
            props: buf[n..].to_vec(),
        })
    }
}

/// The fixed-width tail of a table file, the only anchor a reader has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub format: TableFormat,
    pub checksum: ChecksumType,
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FOOTER_LEN];
        buf[0] = self.checksum as u8;
        let mut handles = Vec::with_capacity(2 * MAX_BLOCK_HANDLE_LEN);
        self.metaindex_handle.encode(&mut handles);
        buf[1..1 + handles.len()].copy_from_slice(&handles);
        handles.clear();
        self.index_handle.encode(&mut handles);
        buf[1 + MAX_BLOCK_HANDLE_LEN..1 + MAX_BLOCK_HANDLE_LEN + handles.len()]
            .copy_from_slice(&handles);
        let tail = FOOTER_LEN - 12;
        LittleEndian::write_u32(&mut buf[tail..tail + 4], self.format as u32);
        LittleEndian::write_u64(&mut buf[tail + 4..], TABLE_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Footer> {
        if buf.len() < FOOTER_LEN {
            return Err(Error::InvalidData("footer too short".to_string()));
        }
        let buf = &buf[buf.len() - FOOTER_LEN..];
        let magic = LittleEndian::read_u64(&buf[FOOTER_LEN - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Error::InvalidData("bad table magic".to_string()));
        }
        let checksum = ChecksumType::from_u8(buf[0])
            .ok_or_else(|| Error::InvalidData(format!("unknown checksum type {}", buf[0])))?;
        let format_raw = LittleEndian::read_u32(&buf[FOOTER_LEN - 12..FOOTER_LEN - 8]);
        let format = TableFormat::from_u32(format_raw)
            .ok_or_else(|| Error::InvalidData(format!("unknown table format {format_raw}")))?;
        let (metaindex_handle, _) = BlockHandle::decode(&buf[1..1 + MAX_BLOCK_HANDLE_LEN])?;
        let (index_handle, _) = BlockHandle::decode(
            &buf[1 + MAX_BLOCK_HANDLE_LEN..1 + 2 * MAX_BLOCK_HANDLE_LEN],
        )?;
        Ok(Footer {
            format,
            checksum,
            metaindex_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_handle_roundtrip() {
        let bh = BlockHandle {
            offset: 123_456_789,
            length: 4096,
        };
        let encoded = bh.encoded();
        let (decoded, n) = BlockHandle::decode(&encoded).unwrap();
        assert_eq!(decoded, bh);
        assert_eq!(n, encoded.len());
    }

    #[test]
    fn handle_with_properties_roundtrip() {
        let bhp = BlockHandleWithProperties {
            handle: BlockHandle {
                offset: 77,
                length: 512,
            },
            props: b"\x00\x03abc".to_vec(),
        };
        let decoded = BlockHandleWithProperties::decode(&bhp.encoded()).unwrap();
        assert_eq!(decoded, bhp);
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            format: TableFormat::V4,
            checksum: ChecksumType::Crc32c,
            metaindex_handle: BlockHandle {
                offset: 9000,
                length: 120,
            },
            index_handle: BlockHandle {
                offset: 8000,
                length: 900,
            },
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_LEN);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            format: TableFormat::V2,
            checksum: ChecksumType::Xxh64,
            metaindex_handle: BlockHandle::default(),
            index_handle: BlockHandle::default(),
        };
        let mut encoded = footer.encode();
        let n = encoded.len();
        encoded[n - 1] ^= 0xff;
        assert!(Footer::decode(&encoded).is_err());
    }
}
