//! Reassembles records from chunked WAL blocks.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::wal::{chunk_checksum, ChunkType, BLOCK_SIZE, HEADER_SIZE};

/// Iterates over the records of a WAL, verifying checksums and chunk
/// sequencing. Corruption surfaces as an `Err` item; a clean end of input
/// ends the iteration.
pub struct LogReader<R: Read> {
    reader: R,
    block: Vec<u8>,
    block_len: usize,
    pos: usize,
    eof: bool,
}

impl<R: Read> LogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            pos: 0,
            eof: false,
        }
    }

    /// Loads the next physical block. The final block may be short.
    fn load_block(&mut self) -> Result<bool> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.block_len = filled;
        self.pos = 0;
        if filled == 0 {
            self.eof = true;
        }
        Ok(filled > 0)
    }

    /// The next chunk, or None at clean end of input.
    fn next_chunk(&mut self) -> Result<Option<(ChunkType, Vec<u8>)>> {
        loop {
            if self.eof {
                return Ok(None);
            }
            if self.pos + HEADER_SIZE > self.block_len {
                if !self.load_block()? {
                    return Ok(None);
                }
                continue;
            }
            let header = &self.block[self.pos..self.pos + HEADER_SIZE];
            let checksum = LittleEndian::read_u32(&header[..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let type_byte = header[6];

            if type_byte == 0 && length == 0 && checksum == 0 {
                // Zero-filled block tail; resume at the next block.
                self.pos = self.block_len;
                continue;
            }
            let chunk_type = ChunkType::from_u8(type_byte)
                .ok_or_else(|| Error::InvalidData(format!("invalid chunk type {type_byte}")))?;
            let start = self.pos + HEADER_SIZE;
            if start + length > self.block_len {
                return Err(Error::InvalidData("chunk overruns its block".to_string()));
            }
            let payload = self.block[start..start + length].to_vec();
            if chunk_checksum(chunk_type, &payload) != checksum {
                return Err(Error::InvalidData("chunk checksum mismatch".to_string()));
            }
            self.pos = start + length;
            return Ok(Some((chunk_type, payload)));
        }
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut record: Option<Vec<u8>> = None;
        loop {
            let Some((chunk_type, payload)) = self.next_chunk()? else {
                return match record {
                    // The file ended mid-record; a crash during the write.
                    Some(_) => Err(Error::InvalidData(
                        "log ended in the middle of a record".to_string(),
                    )),
                    None => Ok(None),
                };
            };
            match (chunk_type, &mut record) {
                (ChunkType::Full, None) => return Ok(Some(payload)),
                (ChunkType::First, None) => record = Some(payload),
                (ChunkType::Middle, Some(partial)) => partial.extend_from_slice(&payload),
                (ChunkType::Last, Some(partial)) => {
                    partial.extend_from_slice(&payload);
                    return Ok(record);
                }
                _ => {
                    return Err(Error::InvalidData(format!(
                        "chunk {chunk_type:?} out of sequence"
                    )));
                }
            }
        }
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.eof = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chunk(chunk_type: ChunkType, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut out[..4], chunk_checksum(chunk_type, payload));
        LittleEndian::write_u16(&mut out[4..6], payload.len() as u16);
        out[6] = chunk_type as u8;
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_full_and_fragmented_records() {
        let mut log = Vec::new();
        log.extend(chunk(ChunkType::Full, b"one"));
        log.extend(chunk(ChunkType::First, b"two-"));
        log.extend(chunk(ChunkType::Middle, b"three-"));
        log.extend(chunk(ChunkType::Last, b"four"));

        let records: Vec<_> = LogReader::new(Cursor::new(log))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records, vec![b"one".to_vec(), b"two-three-four".to_vec()]);
    }

    #[test]
    fn detects_corruption() {
        let mut log = chunk(ChunkType::Full, b"payload");
        log[HEADER_SIZE] ^= 0xff;
        let mut reader = LogReader::new(Cursor::new(log));
        assert!(matches!(reader.next(), Some(Err(Error::InvalidData(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn skips_zero_padded_block_tails() {
        let mut log = chunk(ChunkType::Full, &vec![b'x'; BLOCK_SIZE - HEADER_SIZE - 3]);
        // Tail of block 0 is too small for a header and stays zero.
        log.resize(BLOCK_SIZE, 0);
        log.extend(chunk(ChunkType::Full, b"next-block"));

        let records: Vec<_> = LogReader::new(Cursor::new(log))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], b"next-block");
    }

    #[test]
    fn out_of_sequence_chunk_is_an_error() {
        let log = chunk(ChunkType::Middle, b"orphan");
        let mut reader = LogReader::new(Cursor::new(log));
        assert!(matches!(reader.next(), Some(Err(Error::InvalidData(_)))));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let log = chunk(ChunkType::First, b"beginning");
        let mut reader = LogReader::new(Cursor::new(log));
        assert!(matches!(reader.next(), Some(Err(Error::InvalidData(_)))));
    }
}
