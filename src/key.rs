//! Internal keys and the comparer seam.
//!
//! An internal key is a user key plus a 64-bit trailer packing a sequence
//! number (upper 56 bits) and a key kind (lower 8 bits). Within a table,
//! internal keys sort by user key ascending, then by trailer descending, so
//! newer entries for the same user key come first.

use std::cmp::Ordering;
use std::fmt;

use crate::encoding::Raw;

/// The kind byte stored in the low 8 bits of a key trailer.
///
/// Numeric values are part of the on-disk format and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum KeyKind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    SingleDelete = 7,
    RangeDelete = 15,
    SetWithDelete = 18,
    RangeKeyDelete = 19,
    RangeKeyUnset = 20,
    RangeKeySet = 21,
    DeleteSized = 23,
}

/// In-block flag marking a point key as obsolete (shadowed by a newer entry
/// or a range delete). Readers mask it off before interpreting the kind.
pub const KIND_OBSOLETE_BIT: u8 = 0x80;

impl KeyKind {
    pub fn from_u8(v: u8) -> Option<KeyKind> {
        match v & !KIND_OBSOLETE_BIT {
            0 => Some(KeyKind::Delete),
            1 => Some(KeyKind::Set),
            2 => Some(KeyKind::Merge),
            7 => Some(KeyKind::SingleDelete),
            15 => Some(KeyKind::RangeDelete),
            18 => Some(KeyKind::SetWithDelete),
            19 => Some(KeyKind::RangeKeyDelete),
            20 => Some(KeyKind::RangeKeyUnset),
            21 => Some(KeyKind::RangeKeySet),
            23 => Some(KeyKind::DeleteSized),
            _ => None,
        }
    }

    /// True for the range-key kinds, which may only enter through the
    /// range-key entry points.
    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            KeyKind::RangeKeySet | KeyKind::RangeKeyUnset | KeyKind::RangeKeyDelete
        )
    }

    /// True for point deletes of every flavor.
    pub fn is_point_delete(self) -> bool {
        matches!(
            self,
            KeyKind::Delete | KeyKind::SingleDelete | KeyKind::DeleteSized
        )
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            KeyKind::Delete => "DEL",
            KeyKind::Set => "SET",
            KeyKind::Merge => "MERGE",
            KeyKind::SingleDelete => "SINGLEDEL",
            KeyKind::RangeDelete => "RANGEDEL",
            KeyKind::SetWithDelete => "SETWITHDEL",
            KeyKind::RangeKeyDelete => "RANGEKEYDEL",
            KeyKind::RangeKeyUnset => "RANGEKEYUNSET",
            KeyKind::RangeKeySet => "RANGEKEYSET",
            KeyKind::DeleteSized => "DELSIZED",
        };
        write!(f, "{name}")
    }
}

/// Largest representable sequence number (56 bits).
pub const SEQ_NUM_MAX: u64 = (1 << 56) - 1;

/// Packs a sequence number and kind into a trailer.
pub fn make_trailer(seq_num: u64, kind: KeyKind) -> u64 {
    (seq_num << 8) | kind as u64
}

/// Extracts the sequence number from a trailer.
pub fn trailer_seq_num(trailer: u64) -> u64 {
    trailer >> 8
}

/// Extracts the kind from a trailer. Panics on an unknown kind byte, which
/// can only arise from memory corruption since trailers are constructed
/// through `make_trailer`.
pub fn trailer_kind(trailer: u64) -> KeyKind {
    KeyKind::from_u8(trailer as u8).expect("invalid key kind in trailer")
}

/// A user key with its trailer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq_num: u64, kind: KeyKind) -> Self {
        InternalKey {
            user_key: user_key.into(),
            trailer: make_trailer(seq_num, kind),
        }
    }

    /// An exclusive sentinel for `user_key`: sorts before every real entry
    /// with the same user key. Used for the end bounds of range tombstones
    /// and range keys, which are exclusive while table bounds are inclusive.
    pub fn exclusive_sentinel(user_key: impl Into<Vec<u8>>, kind: KeyKind) -> Self {
        InternalKey::new(user_key, SEQ_NUM_MAX, kind)
    }

    pub fn seq_num(&self) -> u64 {
        trailer_seq_num(self.trailer)
    }

    pub fn kind(&self) -> KeyKind {
        trailer_kind(self.trailer)
    }

    /// Encoded size: user key plus the 8-byte trailer.
    pub fn size(&self) -> usize {
        self.user_key.len() + 8
    }

    /// A key that orders after `self` and at-or-before `other_user_key`,
    /// preferring the shortest such user key. Used for index separators
    /// between adjacent data blocks.
    pub fn separator(&self, c: &dyn Comparer, other_user_key: &[u8]) -> InternalKey {
        let mut sep = Vec::new();
        c.separator(&mut sep, &self.user_key, other_user_key);
        if sep.len() <= self.user_key.len() && c.compare(&self.user_key, &sep) == Ordering::Less {
            // The separator is physically shorter but logically after this
            // key. The max sequence number makes it sort before any real
            // entry with the same user key.
            return InternalKey {
                user_key: sep,
                trailer: make_trailer(SEQ_NUM_MAX, KeyKind::Set),
            };
        }
        self.clone()
    }

    /// A short key ordering after `self`; the separator for the final data
    /// block, which has no successor block to bound it.
    pub fn successor(&self, c: &dyn Comparer) -> InternalKey {
        let mut succ = Vec::new();
        c.successor(&mut succ, &self.user_key);
        if succ.len() <= self.user_key.len() && c.compare(&self.user_key, &succ) == Ordering::Less {
            return InternalKey {
                user_key: succ,
                trailer: make_trailer(SEQ_NUM_MAX, KeyKind::Set),
            };
        }
        self.clone()
    }

    /// Formats the key for error messages: escaped user key, seqnum, kind.
    pub fn pretty(&self) -> String {
        format!("{}#{},{}", Raw::bytes(&self.user_key), self.seq_num(), self.kind())
    }
}

/// Compares two internal keys: user key ascending, trailer descending.
pub fn internal_compare(c: &dyn Comparer, a: &InternalKey, b: &InternalKey) -> Ordering {
    match c.compare(&a.user_key, &b.user_key) {
        Ordering::Equal => b.trailer.cmp(&a.trailer),
        ord => ord,
    }
}

/// User-key comparison and key manipulation, configured once per writer.
///
/// `split` partitions a user key into a prefix and a suffix; value
/// separation and the prefix filter operate on the prefix alone.
pub trait Comparer: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Length of the prefix of `key`. The default treats the whole key as
    /// the prefix.
    fn split(&self, key: &[u8]) -> usize {
        key.len()
    }

    /// Appends to `dst` a key k with `a ≤ k < b`, as short as possible.
    fn separator(&self, dst: &mut Vec<u8>, a: &[u8], b: &[u8]);

    /// Appends to `dst` a short key k with `a ≤ k`.
    fn successor(&self, dst: &mut Vec<u8>, a: &[u8]);
}

/// Lexicographic byte ordering with shortest-separator key shortening.
#[derive(Debug, Default)]
pub struct BytewiseComparer;

impl Comparer for BytewiseComparer {
    fn name(&self) -> &'static str {
        "kiln.BytewiseComparer"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn separator(&self, dst: &mut Vec<u8>, a: &[u8], b: &[u8]) {
        let n = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
        if n >= a.len() || n >= b.len() {
            // One key is a prefix of the other; no shortening possible.
            dst.extend_from_slice(a);
            return;
        }
        let diff = a[n];
        if diff < 0xff && diff + 1 < b[n] {
            dst.extend_from_slice(&a[..n]);
            dst.push(diff + 1);
            return;
        }
        dst.extend_from_slice(a);
    }

    fn successor(&self, dst: &mut Vec<u8>, a: &[u8]) {
        for (i, &b) in a.iter().enumerate() {
            if b != 0xff {
                dst.extend_from_slice(&a[..i]);
                dst.push(b + 1);
                return;
            }
        }
        // Run of 0xff bytes; a itself is the only key ≥ a we can produce.
        dst.extend_from_slice(a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_packs_seqnum_and_kind() {
        let t = make_trailer(42, KeyKind::Merge);
        assert_eq!(trailer_seq_num(t), 42);
        assert_eq!(trailer_kind(t), KeyKind::Merge);
        assert_eq!(trailer_seq_num(make_trailer(SEQ_NUM_MAX, KeyKind::Set)), SEQ_NUM_MAX);
    }

    #[test]
    fn internal_ordering_is_seqnum_descending() {
        let c = BytewiseComparer;
        let newer = InternalKey::new(*b"k", 9, KeyKind::Set);
        let older = InternalKey::new(*b"k", 3, KeyKind::Set);
        assert_eq!(internal_compare(&c, &newer, &older), Ordering::Less);
        let other = InternalKey::new(*b"l", 1, KeyKind::Set);
        assert_eq!(internal_compare(&c, &newer, &other), Ordering::Less);
    }

    #[test]
    fn bytewise_separator_shortens() {
        let c = BytewiseComparer;
        let a = InternalKey::new(*b"abcdef", 5, KeyKind::Set);
        let sep = a.separator(&c, b"abq");
        assert_eq!(sep.user_key, b"abd");
        assert_eq!(sep.seq_num(), SEQ_NUM_MAX);

        // Adjacent byte values leave no room to shorten.
        let a = InternalKey::new(*b"abc", 5, KeyKind::Set);
        let sep = a.separator(&c, b"abd");
        assert_eq!(sep.user_key, b"abc");
        assert_eq!(sep.seq_num(), 5);
    }

    #[test]
    fn bytewise_successor_increments_first_non_ff() {
        let c = BytewiseComparer;
        let a = InternalKey::new(vec![0xff, 0x01, 0x02], 1, KeyKind::Set);
        let succ = a.successor(&c);
        assert_eq!(succ.user_key, vec![0xff, 0x02]);
    }

    #[test]
    fn exclusive_sentinel_sorts_first_among_equal_user_keys() {
        let c = BytewiseComparer;
        let sentinel = InternalKey::exclusive_sentinel(*b"d", KeyKind::RangeDelete);
        let real = InternalKey::new(*b"d", 100, KeyKind::Set);
        assert_eq!(internal_compare(&c, &sentinel, &real), Ordering::Less);
    }
}
