//! Core block types: hashes, headers, disk positions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for block header hashes, merkle roots, and transaction IDs.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Marks "no previous block".
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Double SHA-256 over arbitrary bytes.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Block header: the 80-byte proof-of-work puzzle.
///
/// Serialized little-endian in the fixed layout
/// `version || prev_hash || merkle_root || time || bits || nonce`;
/// the header hash is double SHA-256 over exactly those 80 bytes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: i32,
    /// Hash of the previous block header. Zero for the genesis block.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

impl BlockHeader {
    /// Canonical 80-byte serialization.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse a header from the canonical layout. Returns `None` when fewer
    /// than 80 bytes are available.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: i32::from_le_bytes(data[0..4].try_into().ok()?),
            prev_hash: Hash256(data[4..36].try_into().ok()?),
            merkle_root: Hash256(data[36..68].try_into().ok()?),
            time: u32::from_le_bytes(data[68..72].try_into().ok()?),
            bits: u32::from_le_bytes(data[72..76].try_into().ok()?),
            nonce: u32::from_le_bytes(data[76..80].try_into().ok()?),
        })
    }

    /// Compute the block header hash (double SHA-256 of the 80-byte form).
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }
}

/// Position of a record inside a numbered data file.
///
/// `pos` points at the record payload, past the magic and length prefix.
/// An offset of 0 encodes "no record".
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct DiskPos {
    /// Data file number.
    pub file: i32,
    /// Byte offset of the payload within the file.
    pub pos: u32,
}

impl DiskPos {
    /// Create a position.
    pub fn new(file: i32, pos: u32) -> Self {
        Self { file, pos }
    }

    /// The null position.
    pub fn null() -> Self {
        Self { file: -1, pos: 0 }
    }

    /// Whether this position refers to no record.
    pub fn is_null(&self) -> bool {
        self.pos == 0
    }
}

impl fmt::Display for DiskPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}
