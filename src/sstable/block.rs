use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::put_varint32;
use crate::key::{InternalKey, KIND_OBSOLETE_BIT};

/// Size of a finished block with no entries: one restart point plus the
/// restart count.
pub const EMPTY_BLOCK_SIZE: usize = 8;

/// Accumulates internal-key entries and serializes them into a block.
///
/// Entries are prefix-compressed against the previous key: each entry stores
/// the shared user-key prefix length, the unshared length, and the value
/// length as varints, followed by the unshared key bytes (the 8-byte trailer
/// is always unshared) and the value. Every `restart_interval` entries a
/// restart point is emitted where the full key is written; the restart
/// offsets are appended to the block tail for binary search.
///
/// On-disk layout of a block:
/// ```text
/// +--------------------------------------------------------------+
/// | Entry 0: [shared][unshared][val_len][unshared key][value]    |
/// | Entry 1: ...                                                 |
/// +--------------------------------------------------------------+
/// | Restart array: [off_0(4B)]...[off_R(4B)] | Num restarts (4B) |
/// +--------------------------------------------------------------+
/// ```
pub struct BlockWriter {
    restart_interval: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    n_entries: usize,
    next_restart: usize,
    /// Encoded internal key (user key + trailer) of the last entry added.
    cur_key: Vec<u8>,
    /// Range of the last value within `buf`.
    cur_value: (usize, usize),
}

impl BlockWriter {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buf: Vec::new(),
            restarts: Vec::new(),
            n_entries: 0,
            next_restart: 0,
            cur_key: Vec::new(),
            cur_value: (0, 0),
        }
    }

    /// Adds an entry, sharing as much user-key prefix with the previous
    /// entry as the restart schedule allows.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) {
        self.add_with_optional_value_prefix(key, false, value, key.user_key.len(), None);
    }

    /// Adds an entry with the in-block obsolete bit and an optional value
    /// prefix byte. `max_shared_key_len` caps prefix sharing; value
    /// separation limits it to the previous key's prefix so suffixes stay
    /// byte-comparable in place.
    pub fn add_with_optional_value_prefix(
        &mut self,
        key: &InternalKey,
        is_obsolete: bool,
        value: &[u8],
        max_shared_key_len: usize,
        value_prefix: Option<u8>,
    ) {
        let shared = if self.n_entries == self.next_restart {
            self.next_restart = self.n_entries + self.restart_interval;
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            let prev_user = &self.cur_key[..self.cur_key.len() - 8];
            let limit = max_shared_key_len.min(prev_user.len()).min(key.user_key.len());
            prev_user[..limit]
                .iter()
                .zip(key.user_key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        };

        let mut trailer = key.trailer;
        if is_obsolete {
            trailer |= u64::from(KIND_OBSOLETE_BIT);
        }

        self.cur_key.clear();
        self.cur_key.extend_from_slice(&key.user_key);
        let mut trailer_buf = [0u8; 8];
        LittleEndian::write_u64(&mut trailer_buf, trailer);
        self.cur_key.extend_from_slice(&trailer_buf);

        let unshared = key.user_key.len() + 8 - shared;
        let value_len = value.len() + usize::from(value_prefix.is_some());
        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, unshared as u32);
        put_varint32(&mut self.buf, value_len as u32);
        self.buf.extend_from_slice(&key.user_key[shared..]);
        self.buf.extend_from_slice(&trailer_buf);
        let value_start = self.buf.len();
        if let Some(prefix) = value_prefix {
            self.buf.push(prefix);
        }
        self.buf.extend_from_slice(value);
        self.cur_value = (value_start, self.buf.len());

        self.n_entries += 1;
    }

    /// The last key added, with the obsolete bit masked off. The zero key
    /// when the block is empty.
    pub fn cur_key(&self) -> InternalKey {
        if self.cur_key.is_empty() {
            return InternalKey::default();
        }
        let user = self.cur_key[..self.cur_key.len() - 8].to_vec();
        let trailer = LittleEndian::read_u64(&self.cur_key[self.cur_key.len() - 8..])
            & !u64::from(KIND_OBSOLETE_BIT);
        InternalKey {
            user_key: user,
            trailer,
        }
    }

    /// The user key of the last entry added.
    pub fn cur_user_key(&self) -> &[u8] {
        if self.cur_key.is_empty() {
            return &[];
        }
        &self.cur_key[..self.cur_key.len() - 8]
    }

    /// The value of the last entry added, including any prefix byte.
    pub fn cur_value(&self) -> &[u8] {
        &self.buf[self.cur_value.0..self.cur_value.1]
    }

    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    pub fn restart_interval(&self) -> usize {
        self.restart_interval
    }

    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// Current serialized size: entry bytes plus the restart array.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    /// Finalizes the block, appending the restart array and count.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        let mut block = std::mem::take(&mut self.buf);
        for restart in &self.restarts {
            let mut tmp = [0u8; 4];
            LittleEndian::write_u32(&mut tmp, *restart);
            block.extend_from_slice(&tmp);
        }
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, self.restarts.len() as u32);
        block.extend_from_slice(&tmp);
        block
    }

    /// Resets the writer for reuse without releasing its buffers.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.n_entries = 0;
        self.next_restart = 0;
        self.cur_key.clear();
        self.cur_value = (0, 0);
    }
}

/// A block writer for raw byte keys without trailers, used for the
/// metaindex and properties blocks.
pub struct RawBlockWriter {
    restart_interval: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    n_entries: usize,
    next_restart: usize,
    last_key: Vec<u8>,
}

impl RawBlockWriter {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buf: Vec::new(),
            restarts: Vec::new(),
            n_entries: 0,
            next_restart: 0,
            last_key: Vec::new(),
        }
    }

    /// Adds a raw key/value entry. Keys must arrive in sorted order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.n_entries == self.next_restart {
            self.next_restart = self.n_entries + self.restart_interval;
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        };

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, (key.len() - shared) as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.n_entries += 1;
    }

    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    pub fn finish(&mut self) -> Vec<u8> {
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        let mut block = std::mem::take(&mut self.buf);
        for restart in &self.restarts {
            let mut tmp = [0u8; 4];
            LittleEndian::write_u32(&mut tmp, *restart);
            block.extend_from_slice(&tmp);
        }
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, self.restarts.len() as u32);
        block.extend_from_slice(&tmp);
        block
    }
}

#[cfg(test)]
pub(crate) fn decode_block_entries(block: &[u8]) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
    use crate::encoding::get_varint32;

    let n_restarts = LittleEndian::read_u32(&block[block.len() - 4..]) as usize;
    let data_end = block.len() - 4 - n_restarts * 4;
    let mut entries = Vec::new();
    let mut pos = 0;
    let mut prev_key: Vec<u8> = Vec::new();
    while pos < data_end {
        let (shared, n) = get_varint32(&block[pos..]).unwrap();
        pos += n;
        let (unshared, n) = get_varint32(&block[pos..]).unwrap();
        pos += n;
        let (value_len, n) = get_varint32(&block[pos..]).unwrap();
        pos += n;
        let mut key = prev_key[..shared as usize].to_vec();
        key.extend_from_slice(&block[pos..pos + unshared as usize]);
        pos += unshared as usize;
        let value = block[pos..pos + value_len as usize].to_vec();
        pos += value_len as usize;
        let trailer = LittleEndian::read_u64(&key[key.len() - 8..]);
        entries.push((key[..key.len() - 8].to_vec(), trailer, value));
        prev_key = key;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyKind;

    #[test]
    fn entries_roundtrip_with_prefix_compression() {
        let mut w = BlockWriter::new(16);
        for i in 0..50u32 {
            let key = InternalKey::new(
                format!("key_{i:05}").into_bytes(),
                100 - u64::from(i),
                KeyKind::Set,
            );
            w.add(&key, format!("val{i}").as_bytes());
        }
        assert_eq!(w.n_entries(), 50);
        let block = w.finish();

        let entries = decode_block_entries(&block);
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].0, b"key_00000");
        assert_eq!(entries[49].0, b"key_00049");
        assert_eq!(entries[7].2, b"val7");
    }

    #[test]
    fn restart_points_every_interval() {
        let mut w = BlockWriter::new(4);
        for i in 0..10u32 {
            let key = InternalKey::new(format!("k{i:03}").into_bytes(), 1, KeyKind::Set);
            w.add(&key, b"v");
        }
        let block = w.finish();
        let n_restarts = LittleEndian::read_u32(&block[block.len() - 4..]);
        // 10 entries with interval 4: restarts at entries 0, 4, 8.
        assert_eq!(n_restarts, 3);
    }

    #[test]
    fn obsolete_bit_is_set_in_block_and_masked_by_cur_key() {
        let mut w = BlockWriter::new(16);
        let key = InternalKey::new(*b"k", 5, KeyKind::Set);
        w.add_with_optional_value_prefix(&key, true, b"v", 1, None);

        let cur = w.cur_key();
        assert_eq!(cur.kind(), KeyKind::Set);
        assert_eq!(cur.trailer, key.trailer);

        let block = w.finish();
        let entries = decode_block_entries(&block);
        assert_eq!(
            entries[0].1 & u64::from(KIND_OBSOLETE_BIT),
            u64::from(KIND_OBSOLETE_BIT)
        );
    }

    #[test]
    fn value_prefix_byte_precedes_value() {
        let mut w = BlockWriter::new(16);
        let key = InternalKey::new(*b"k", 5, KeyKind::Set);
        w.add_with_optional_value_prefix(&key, false, b"payload", 1, Some(0x42));
        assert_eq!(w.cur_value(), b"\x42payload");
    }

    #[test]
    fn max_shared_key_len_caps_sharing() {
        let mut w = BlockWriter::new(16);
        w.add(&InternalKey::new(*b"prefix_aaa", 9, KeyKind::Set), b"1");
        // Cap sharing at 6 bytes even though 8 bytes are common.
        w.add_with_optional_value_prefix(
            &InternalKey::new(*b"prefix_abb", 8, KeyKind::Set),
            false,
            b"2",
            6,
            None,
        );
        let block = w.finish();
        let entries = decode_block_entries(&block);
        assert_eq!(entries[1].0, b"prefix_abb");
    }

    #[test]
    fn empty_block_finishes_with_one_restart() {
        let mut w = BlockWriter::new(16);
        let block = w.finish();
        assert_eq!(block.len(), EMPTY_BLOCK_SIZE);
        assert_eq!(LittleEndian::read_u32(&block[block.len() - 4..]), 1);
    }

    #[test]
    fn raw_block_entries_share_prefixes() {
        let mut w = RawBlockWriter::new(16);
        w.add(b"rocksdb.properties", b"a");
        w.add(b"rocksdb.range_del", b"b");
        assert_eq!(w.n_entries(), 2);
        let uncompressed_len = 18 + 17;
        let block = w.finish();
        // The second key shares "rocksdb." with the first.
        assert!(block.len() < uncompressed_len + 2 * 3 + 2 + 8);
    }
}
