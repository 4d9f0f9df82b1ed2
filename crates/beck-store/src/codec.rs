//! On-disk record framing.
//!
//! Every record in a data file is framed as `magic || length || payload`,
//! little-endian, with the four magic bytes chosen by the chain parameters.
//! Undo records additionally carry a trailing 32-byte checksum of
//! `double_sha256(block_hash || payload)`, binding the undo data to the
//! block it reverses.

use std::sync::Arc;

use beck_core::error::StoreError;
use beck_core::types::{double_sha256, Hash256};

use crate::mapper::{MappedFile, MappedSlice};

/// Bytes of framing preceding every payload: 4 magic + 4 length.
pub const FRAME_HEADER_SIZE: u32 = 8;

/// Trailing checksum bytes on an undo record.
pub const UNDO_CHECKSUM_SIZE: u32 = 32;

/// Checksum binding an undo payload to its block hash.
pub fn undo_checksum(block_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(block_hash.as_bytes());
    data.extend_from_slice(payload);
    double_sha256(&data)
}

/// Validate framing at `pos` and return the payload length.
///
/// `pos` points at the payload; the length prefix sits at `pos - 4` and the
/// magic before that. `trailer` is the number of checksum bytes expected
/// after the payload.
fn check_frame(file: &MappedFile, pos: u32, trailer: u32) -> Result<u32, StoreError> {
    if pos < 4 {
        return Err(StoreError::InvalidArgument(format!(
            "record position {pos} inside file framing"
        )));
    }
    if pos < FRAME_HEADER_SIZE {
        return Err(StoreError::Corruption(format!(
            "record position {pos} overlaps the frame header"
        )));
    }
    let bytes = file.bytes();
    if pos as usize > bytes.len() {
        return Err(StoreError::Corruption(format!(
            "record position {pos} outside file of {} bytes",
            bytes.len()
        )));
    }
    let len_at = (pos - 4) as usize;
    let len = u32::from_le_bytes(
        bytes[len_at..len_at + 4]
            .try_into()
            .map_err(|_| StoreError::Corruption("truncated length prefix".into()))?,
    );
    let end = pos as u64 + len as u64 + trailer as u64;
    if end > bytes.len() as u64 {
        return Err(StoreError::Corruption(format!(
            "record of {len} bytes at {pos} larger than file of {} bytes",
            bytes.len()
        )));
    }
    Ok(len)
}

/// Read one forward block record. Returns a view of the payload.
pub fn read_block(file: &Arc<MappedFile>, pos: u32) -> Result<MappedSlice, StoreError> {
    let len = check_frame(file, pos, 0)?;
    Ok(MappedSlice::new(Arc::clone(file), pos as usize, len as usize))
}

/// Read one undo record, verifying its checksum against `expected_hash`.
pub fn read_undo(
    file: &Arc<MappedFile>,
    pos: u32,
    expected_hash: &Hash256,
) -> Result<MappedSlice, StoreError> {
    let len = check_frame(file, pos, UNDO_CHECKSUM_SIZE)?;
    let bytes = file.bytes();
    let payload = &bytes[pos as usize..(pos + len) as usize];
    let stored = &bytes[(pos + len) as usize..(pos + len + UNDO_CHECKSUM_SIZE) as usize];
    if undo_checksum(expected_hash, payload).as_bytes() != stored {
        return Err(StoreError::Corruption("undo record checksum mismatch".into()));
    }
    Ok(MappedSlice::new(Arc::clone(file), pos as usize, len as usize))
}

/// Frame a forward block record at `*fill`.
///
/// Advances `*fill` past the frame and returns a view of the payload just
/// written. The caller has already ensured the file has room.
pub fn write_block_record(
    file: &Arc<MappedFile>,
    fill: &mut u32,
    magic: [u8; 4],
    payload: &[u8],
) -> MappedSlice {
    let start = *fill as usize;
    file.write_at(start, &magic);
    file.write_at(start + 4, &(payload.len() as u32).to_le_bytes());
    file.write_at(start + 8, payload);
    let offset = *fill + FRAME_HEADER_SIZE;
    *fill += payload.len() as u32 + FRAME_HEADER_SIZE;
    MappedSlice::new(Arc::clone(file), offset as usize, payload.len())
}

/// Frame an undo record at `*fill`, appending the checksum for
/// `block_hash`.
pub fn write_undo_record(
    file: &Arc<MappedFile>,
    fill: &mut u32,
    magic: [u8; 4],
    payload: &[u8],
    block_hash: &Hash256,
) -> MappedSlice {
    let start = *fill as usize;
    file.write_at(start, &magic);
    file.write_at(start + 4, &(payload.len() as u32).to_le_bytes());
    file.write_at(start + 8, payload);
    let checksum = undo_checksum(block_hash, payload);
    file.write_at(start + 8 + payload.len(), checksum.as_bytes());
    let offset = *fill + FRAME_HEADER_SIZE;
    *fill += payload.len() as u32 + FRAME_HEADER_SIZE + UNDO_CHECKSUM_SIZE;
    MappedSlice::new(Arc::clone(file), offset as usize, payload.len())
}
