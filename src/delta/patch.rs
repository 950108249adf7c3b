//! Binary patch format ("MDP1")
//!
//! ```text
//! magic     b"MDP1"
//! base_len  u64 LE
//! target_len u64 LE
//! ops...    0x01 COPY   offset:u64 LE, len:u32 LE   (bytes from the base)
//!           0x02 INSERT len:u32 LE, bytes[len]      (literal bytes)
//! ```
//!
//! The diff indexes fixed-size blocks of the base by content and scans the
//! target for matches, extending each match forward as far as it goes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read};

pub const MAGIC: &[u8; 4] = b"MDP1";
pub const BLOCK_SIZE: usize = 32;

const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;
const HEADER_LEN: usize = 4 + 8 + 8;
/// Largest single op; longer runs are split
const MAX_OP_LEN: usize = u32::MAX as usize;

/// Reasons a patch cannot be applied
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("bad magic")]
    BadMagic,
    #[error("truncated patch")]
    Truncated,
    #[error("patch expects base of {expected} bytes, got {actual}")]
    BaseLengthMismatch { expected: u64, actual: u64 },
    #[error("copy of {len} bytes at offset {offset} is outside the base")]
    CopyOutOfBounds { offset: u64, len: u32 },
    #[error("unknown op 0x{0:02x}")]
    UnknownOp(u8),
    #[error("patch produced {actual} bytes, header declares {expected}")]
    TargetLengthMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Copy { offset: usize, len: usize },
    Insert { start: usize, len: usize },
}

struct Encoder {
    out: Vec<u8>,
}

impl Encoder {
    fn new(base_len: usize, target_len: usize) -> Self {
        let mut out = Vec::with_capacity(HEADER_LEN + target_len / 8);
        out.extend_from_slice(MAGIC);
        // Writes into a Vec cannot fail
        let _ = out.write_u64::<LittleEndian>(base_len as u64);
        let _ = out.write_u64::<LittleEndian>(target_len as u64);
        Self { out }
    }

    fn push(&mut self, op: Op, target: &[u8]) {
        match op {
            Op::Copy { mut offset, mut len } => {
                while len > 0 {
                    let chunk = len.min(MAX_OP_LEN);
                    self.out.push(OP_COPY);
                    let _ = self.out.write_u64::<LittleEndian>(offset as u64);
                    let _ = self.out.write_u32::<LittleEndian>(chunk as u32);
                    offset += chunk;
                    len -= chunk;
                }
            }
            Op::Insert { start, len } => {
                for chunk in target[start..start + len].chunks(MAX_OP_LEN) {
                    self.out.push(OP_INSERT);
                    let _ = self.out.write_u32::<LittleEndian>(chunk.len() as u32);
                    self.out.extend_from_slice(chunk);
                }
            }
        }
    }
}

/// Compute a patch that turns `base` into `target`
pub fn diff(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut blocks: HashMap<&[u8], usize> = HashMap::with_capacity(base.len() / BLOCK_SIZE + 1);
    for (i, block) in base.chunks_exact(BLOCK_SIZE).enumerate() {
        blocks.entry(block).or_insert(i * BLOCK_SIZE);
    }

    let mut encoder = Encoder::new(base.len(), target.len());
    let mut literal_start = 0;
    let mut pos = 0;

    while pos + BLOCK_SIZE <= target.len() {
        let Some(&offset) = blocks.get(&target[pos..pos + BLOCK_SIZE]) else {
            pos += 1;
            continue;
        };

        let mut len = BLOCK_SIZE;
        while offset + len < base.len()
            && pos + len < target.len()
            && base[offset + len] == target[pos + len]
        {
            len += 1;
        }

        if literal_start < pos {
            encoder.push(
                Op::Insert {
                    start: literal_start,
                    len: pos - literal_start,
                },
                target,
            );
        }
        encoder.push(Op::Copy { offset, len }, target);
        pos += len;
        literal_start = pos;
    }

    if literal_start < target.len() {
        encoder.push(
            Op::Insert {
                start: literal_start,
                len: target.len() - literal_start,
            },
            target,
        );
    }

    encoder.out
}

/// Apply a patch produced by [`diff`] to `base`
pub fn apply(base: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut cursor = Cursor::new(patch);

    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| PatchError::Truncated)?;
    if &magic != MAGIC {
        return Err(PatchError::BadMagic);
    }

    let base_len = read_u64(&mut cursor)?;
    let target_len = read_u64(&mut cursor)?;
    if base_len != base.len() as u64 {
        return Err(PatchError::BaseLengthMismatch {
            expected: base_len,
            actual: base.len() as u64,
        });
    }

    // Cap the reservation so a hostile header cannot force a huge allocation
    let reserve = (target_len as usize).min(base.len() + patch.len());
    let mut out = Vec::with_capacity(reserve);

    while (cursor.position() as usize) < patch.len() {
        let op = cursor.read_u8().map_err(|_| PatchError::Truncated)?;
        match op {
            OP_COPY => {
                let offset = read_u64(&mut cursor)?;
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| PatchError::Truncated)?;
                let end = offset
                    .checked_add(u64::from(len))
                    .filter(|end| *end <= base.len() as u64)
                    .ok_or(PatchError::CopyOutOfBounds { offset, len })?;
                out.extend_from_slice(&base[offset as usize..end as usize]);
            }
            OP_INSERT => {
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| PatchError::Truncated)? as usize;
                let start = cursor.position() as usize;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= patch.len())
                    .ok_or(PatchError::Truncated)?;
                out.extend_from_slice(&patch[start..end]);
                cursor.set_position(end as u64);
            }
            other => return Err(PatchError::UnknownOp(other)),
        }

        if out.len() as u64 > target_len {
            break;
        }
    }

    if out.len() as u64 != target_len {
        return Err(PatchError::TargetLengthMismatch {
            expected: target_len,
            actual: out.len() as u64,
        });
    }

    Ok(out)
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, PatchError> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| PatchError::Truncated)
}
