use std::fmt;

/// Block compression codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    #[default]
    Snappy,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "NoCompression"),
            Compression::Snappy => write!(f, "Snappy"),
        }
    }
}

/// Block-type byte written into the 5-byte block trailer.
pub const NO_COMPRESSION_BLOCK_TYPE: u8 = 0;
pub const SNAPPY_BLOCK_TYPE: u8 = 1;

/// Compresses `src` into `scratch`, returning the block-type byte and the
/// bytes to write. Compression is kept only when the output is at least
/// 12.5% smaller than the input; otherwise the uncompressed input is used
/// and the type byte says so.
pub fn compress<'a>(
    compression: Compression,
    src: &'a [u8],
    scratch: &'a mut Vec<u8>,
) -> (u8, &'a [u8]) {
    match compression {
        Compression::None => (NO_COMPRESSION_BLOCK_TYPE, src),
        Compression::Snappy => {
            scratch.resize(snap::raw::max_compress_len(src.len()), 0);
            let n = snap::raw::Encoder::new()
                .compress(src, scratch)
                .expect("snappy compression of an in-memory buffer cannot fail");
            scratch.truncate(n);
            if n < src.len() - src.len() / 8 {
                (SNAPPY_BLOCK_TYPE, &scratch[..])
            } else {
                (NO_COMPRESSION_BLOCK_TYPE, src)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_data_is_compressed() {
        let src = vec![b'a'; 4096];
        let mut scratch = Vec::new();
        let (ty, out) = compress(Compression::Snappy, &src, &mut scratch);
        assert_eq!(ty, SNAPPY_BLOCK_TYPE);
        assert!(out.len() < src.len() - src.len() / 8);
        let decoded = snap::raw::Decoder::new().decompress_vec(out).unwrap();
        assert_eq!(decoded, src);
    }

    #[test]
    fn incompressible_data_stays_raw() {
        // A short pseudo-random buffer that snappy cannot shrink by 12.5%.
        let src: Vec<u8> = (0u32..64).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let mut scratch = Vec::new();
        let (ty, out) = compress(Compression::Snappy, &src, &mut scratch);
        assert_eq!(ty, NO_COMPRESSION_BLOCK_TYPE);
        assert_eq!(out, &src[..]);
    }

    #[test]
    fn none_passes_through() {
        let src = b"plain".to_vec();
        let mut scratch = Vec::new();
        let (ty, out) = compress(Compression::None, &src, &mut scratch);
        assert_eq!(ty, NO_COMPRESSION_BLOCK_TYPE);
        assert_eq!(out, &src[..]);
    }
}
