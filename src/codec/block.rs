//! Durable block framing (magic + protected length + protected hash).
//!
//! A block is `"fishtrap"` (8 bytes), the Reed-Solomon-protected
//! big-endian payload length (4 data + 4 parity bytes), the protected
//! XXH32 of the payload (same shape), then the payload itself. The magic
//! is matched softly (up to two wrong bytes) so a scan can resynchronise
//! inside damaged streams while the ECC fields carry the real integrity.

use bytes::Bytes;
use thiserror::Error;
use xxhash_rust::xxh32::xxh32;

use super::reed_solomon;

/// Block magic, in ASCII.
pub const BLOCK_MAGIC: &[u8; 8] = b"fishtrap";

/// Magic plus the two protected header fields.
pub const BLOCK_HEADER_LEN: usize = 24;

/// Process-wide seed for the payload hash ('HQJF' read little-endian).
pub const HASH_SEED: u32 = 0x464a_5148;

/// Byte mismatches tolerated when matching the magic.
const MAGIC_SLACK: usize = 2;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("payload of {len} bytes exceeds the u32 length field")]
    PayloadTooLarge { len: usize },
}

/// Frame a payload into a block ready to be appended to a file.
pub fn write_block(payload: &[u8]) -> Result<Vec<u8>, BlockError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| BlockError::PayloadTooLarge { len: payload.len() })?;
    let hash = xxh32(payload, HASH_SEED);

    let mut block = Vec::with_capacity(BLOCK_HEADER_LEN + payload.len());
    block.extend_from_slice(BLOCK_MAGIC);
    block.extend_from_slice(&reed_solomon::encode(&len.to_be_bytes()));
    block.extend_from_slice(&reed_solomon::encode(&hash.to_be_bytes()));
    block.extend_from_slice(payload);
    Ok(block)
}

/// One scan result.
///
/// `length` counts header and payload bytes. `payload == None` with
/// `length > 0` signals a truncated block (the buffer ends before the
/// declared payload); `length == 0` means the buffer is exhausted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedBlock {
    pub offset: usize,
    pub length: usize,
    pub payload: Option<Bytes>,
}

impl ScannedBlock {
    /// True when the buffer ended inside the block this scan found.
    pub fn is_truncated(&self) -> bool {
        self.payload.is_none() && self.length > 0
    }
}

/// Slide through `buf` from `start` and return the next intact block,
/// a truncation marker, or exhaustion. Corrupt candidates (uncorrectable
/// header fields, hash mismatch) are skipped.
pub fn scan_block(buf: &[u8], start: usize) -> ScannedBlock {
    let mut cursor = start;
    loop {
        let Some(offset) = find_magic(buf, cursor) else {
            return ScannedBlock {
                offset: buf.len(),
                length: 0,
                payload: None,
            };
        };

        if offset + 16 > buf.len() {
            // The length field itself is cut off: a block mid-write.
            return ScannedBlock {
                offset,
                length: BLOCK_HEADER_LEN,
                payload: None,
            };
        }

        let length = match reed_solomon::decode(&buf[offset + 8..offset + 16]) {
            Ok(codeword) => {
                u32::from_be_bytes([codeword[0], codeword[1], codeword[2], codeword[3]]) as usize
            }
            Err(_) => {
                cursor = offset + 1;
                continue;
            }
        };

        if length == 0 {
            return ScannedBlock {
                offset,
                length: BLOCK_HEADER_LEN,
                payload: Some(Bytes::new()),
            };
        }

        if offset + BLOCK_HEADER_LEN + length > buf.len() {
            return ScannedBlock {
                offset,
                length: BLOCK_HEADER_LEN + length,
                payload: None,
            };
        }

        let hash = match reed_solomon::decode(&buf[offset + 16..offset + 24]) {
            Ok(codeword) => {
                i32::from_be_bytes([codeword[0], codeword[1], codeword[2], codeword[3]])
            }
            Err(_) => {
                // Resync one byte short of the bad block's end, so the next
                // search window overlaps its final byte.
                cursor = offset + 23 + length;
                continue;
            }
        };

        let payload = &buf[offset + BLOCK_HEADER_LEN..offset + BLOCK_HEADER_LEN + length];
        if xxh32(payload, HASH_SEED) as i32 != hash {
            cursor = offset + 23 + length;
            continue;
        }

        return ScannedBlock {
            offset,
            length: BLOCK_HEADER_LEN + length,
            payload: Some(Bytes::copy_from_slice(payload)),
        };
    }
}

fn find_magic(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < BLOCK_MAGIC.len() {
        return None;
    }
    (start..=buf.len() - BLOCK_MAGIC.len()).find(|&offset| {
        let mismatches = BLOCK_MAGIC
            .iter()
            .zip(&buf[offset..offset + BLOCK_MAGIC.len()])
            .filter(|(expected, actual)| expected != actual)
            .count();
        mismatches <= MAGIC_SLACK
    })
}
