//! Range-key span encoding.
//!
//! A fragmented span becomes one block entry per distinct trailer: the entry
//! key is the span start with that trailer, and the value packs the end key
//! plus the per-suffix payload. RangeKeySet values carry (suffix, value)
//! pairs, RangeKeyUnset values carry suffixes, and RangeKeyDelete values are
//! the bare end key.

use crate::encoding::{get_varint32, put_varint32};
use crate::error::{Error, Result};
use crate::key::{trailer_kind, InternalKey, KeyKind};
use crate::keyspan::{Span, SpanKey};

/// Encodes a fragmented span into block entries, emitting them in trailer
/// order (newest first) through `emit`.
pub fn encode_span(
    span: &Span,
    emit: &mut dyn FnMut(InternalKey, Vec<u8>) -> Result<()>,
) -> Result<()> {
    let mut keys: Vec<&SpanKey> = span.keys.iter().collect();
    keys.sort_by(|a, b| b.trailer.cmp(&a.trailer));

    let mut i = 0;
    while i < keys.len() {
        let trailer = keys[i].trailer;
        let mut j = i;
        while j < keys.len() && keys[j].trailer == trailer {
            j += 1;
        }
        let group = &keys[i..j];
        let kind = trailer_kind(trailer);
        let mut value = Vec::new();
        match kind {
            KeyKind::RangeKeySet => {
                put_varint32(&mut value, span.end.len() as u32);
                value.extend_from_slice(&span.end);
                for key in group {
                    put_varint32(&mut value, key.suffix.len() as u32);
                    value.extend_from_slice(&key.suffix);
                    put_varint32(&mut value, key.value.len() as u32);
                    value.extend_from_slice(&key.value);
                }
            }
            KeyKind::RangeKeyUnset => {
                put_varint32(&mut value, span.end.len() as u32);
                value.extend_from_slice(&span.end);
                for key in group {
                    put_varint32(&mut value, key.suffix.len() as u32);
                    value.extend_from_slice(&key.suffix);
                }
            }
            KeyKind::RangeKeyDelete => {
                value.extend_from_slice(&span.end);
            }
            _ => {
                return Err(Error::KindMisroute(format!(
                    "{kind} key in a range-key span"
                )));
            }
        }
        emit(
            InternalKey {
                user_key: span.start.clone(),
                trailer,
            },
            value,
        )?;
        i = j;
    }
    Ok(())
}

/// Extracts the end key from an encoded range-key value.
pub fn decode_end_key(kind: KeyKind, value: &[u8]) -> Result<&[u8]> {
    match kind {
        KeyKind::RangeKeyDelete => Ok(value),
        KeyKind::RangeKeySet | KeyKind::RangeKeyUnset => {
            let (len, n) = get_varint32(value)
                .map_err(|_| Error::InvalidEndKey("truncated end key length".to_string()))?;
            let end = value
                .get(n..n + len as usize)
                .ok_or_else(|| Error::InvalidEndKey("end key past value".to_string()))?;
            Ok(end)
        }
        _ => Err(Error::InvalidEndKey(format!("{kind} is not a range-key kind"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::make_trailer;

    fn emit_all(span: &Span) -> Vec<(InternalKey, Vec<u8>)> {
        let mut out = Vec::new();
        encode_span(span, &mut |k, v| {
            out.push((k, v));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn set_span_packs_suffix_value_pairs() {
        let span = Span {
            start: b"a".to_vec(),
            end: b"d".to_vec(),
            keys: vec![
                SpanKey {
                    trailer: make_trailer(0, KeyKind::RangeKeySet),
                    suffix: b"@1".to_vec(),
                    value: b"x".to_vec(),
                },
                SpanKey {
                    trailer: make_trailer(0, KeyKind::RangeKeySet),
                    suffix: b"@2".to_vec(),
                    value: b"y".to_vec(),
                },
            ],
        };
        let out = emit_all(&span);
        assert_eq!(out.len(), 1);
        let (key, value) = &out[0];
        assert_eq!(key.user_key, b"a");
        assert_eq!(key.kind(), KeyKind::RangeKeySet);
        assert_eq!(decode_end_key(KeyKind::RangeKeySet, value).unwrap(), b"d");
    }

    #[test]
    fn mixed_kinds_emit_newest_trailer_first() {
        let span = Span {
            start: b"g".to_vec(),
            end: b"m".to_vec(),
            keys: vec![
                SpanKey {
                    trailer: make_trailer(0, KeyKind::RangeKeyDelete),
                    ..Default::default()
                },
                SpanKey {
                    trailer: make_trailer(0, KeyKind::RangeKeySet),
                    suffix: b"@5".to_vec(),
                    value: b"v".to_vec(),
                },
            ],
        };
        let out = emit_all(&span);
        assert_eq!(out.len(), 2);
        // RangeKeySet has the larger kind byte, so the larger trailer.
        assert_eq!(out[0].0.kind(), KeyKind::RangeKeySet);
        assert_eq!(out[1].0.kind(), KeyKind::RangeKeyDelete);
        assert!(out[0].0.trailer > out[1].0.trailer);
        assert_eq!(decode_end_key(KeyKind::RangeKeyDelete, &out[1].1).unwrap(), b"m");
    }

    #[test]
    fn unset_span_packs_suffixes() {
        let span = Span {
            start: b"a".to_vec(),
            end: b"b".to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(7, KeyKind::RangeKeyUnset),
                suffix: b"@3".to_vec(),
                value: Vec::new(),
            }],
        };
        let out = emit_all(&span);
        assert_eq!(out[0].0.seq_num(), 7);
        assert_eq!(decode_end_key(KeyKind::RangeKeyUnset, &out[0].1).unwrap(), b"b");
    }

    #[test]
    fn decode_end_key_rejects_garbage() {
        assert!(decode_end_key(KeyKind::RangeKeySet, &[0x05]).is_err());
        assert!(decode_end_key(KeyKind::Set, b"x").is_err());
    }
}
