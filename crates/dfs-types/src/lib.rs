#![forbid(unsafe_code)]
//! Identifier newtypes and fixed-width records shared across the store.
//!
//! Everything that crosses a crate or node boundary by value lives here:
//! block/inode/transaction/machine ids, the per-block [`Version`] counter,
//! the [`BlockInfo`] indirection triple and its packed block-map encoding,
//! and the little-endian read helpers used by every on-disk decoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block size used when nothing else is configured.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Encoded width of one [`BlockInfo`] inside a block map.
pub const BLOCK_INFO_SIZE: usize = 8 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Identifier of a registered data node ("machine id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacId(pub u16);

/// Per-block generation counter kept by a data node.
///
/// Bumped on every allocate and every free. A reader holding an older
/// version than the stored one has a stale block map.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u32);

impl InodeId {
    /// The root directory, created when a namespace is formatted.
    pub const ROOT: Self = Self(1);
}

impl BlockId {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block for the given block size.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<u64> {
        self.0.checked_mul(u64::from(block_size.get()))
    }
}

impl TxnId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Version {
    #[must_use]
    pub fn bumped(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MacId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as `usize`; `u32` always fits on supported targets.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits one bitmap block can track.
    #[must_use]
    pub fn bits_per_block(self) -> u64 {
        u64::from(self.0) * 8
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Inode type and attributes ───────────────────────────────────────────────

/// Kind of a namespace object. The byte value is the wire/disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InodeType {
    Unknown = 0,
    File = 1,
    Directory = 2,
}

impl InodeType {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a type byte. Unrecognized values map to `Unknown`.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::File,
            2 => Self::Directory,
            _ => Self::Unknown,
        }
    }
}

/// Attributes reported by `get_type_attr`. Times are seconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

// ── Block map ───────────────────────────────────────────────────────────────

/// One entry of a file's block map: which data node holds the block and at
/// which version the metadata node last saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub mac_id: MacId,
    pub version: Version,
}

impl BlockInfo {
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_INFO_SIZE] {
        let mut buf = [0_u8; BLOCK_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.block_id.0.to_le_bytes());
        buf[8..10].copy_from_slice(&self.mac_id.0.to_le_bytes());
        buf[10..14].copy_from_slice(&self.version.0.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_id: BlockId(read_le_u64(bytes, 0)?),
            mac_id: MacId(read_le_u16(bytes, 8)?),
            version: Version(read_le_u32(bytes, 10)?),
        })
    }
}

/// Pack a block map as consecutive fixed-width triples.
#[must_use]
pub fn encode_block_map(map: &[BlockInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * BLOCK_INFO_SIZE);
    for info in map {
        out.extend_from_slice(&info.encode());
    }
    out
}

/// Unpack a block map. The length must be a whole number of triples.
pub fn decode_block_map(bytes: &[u8]) -> Result<Vec<BlockInfo>, ParseError> {
    if bytes.len() % BLOCK_INFO_SIZE != 0 {
        return Err(ParseError::InvalidField {
            field: "block_map",
            reason: "length is not a multiple of the block info size",
        });
    }
    bytes
        .chunks_exact(BLOCK_INFO_SIZE)
        .map(BlockInfo::decode)
        .collect()
}

// ── Little-endian decoding ──────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// `u64` to `usize`, failing instead of truncating.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers_are_little_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(
            read_le_u64(&bytes, 0).expect("u64"),
            0x90AB_CDEF_5678_1234
        );
    }

    #[test]
    fn ensure_slice_reports_short_input() {
        let err = read_le_u32(&[1, 2], 0).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 2,
            }
        );
        assert!(ensure_slice(&[0; 4], usize::MAX, 2).is_err());
    }

    #[test]
    fn block_info_layout_is_fixed_width() {
        let info = BlockInfo {
            block_id: BlockId(0x0102_0304_0506_0708),
            mac_id: MacId(0x0A0B),
            version: Version(0x1122_3344),
        };
        let raw = info.encode();
        assert_eq!(raw.len(), 14);
        assert_eq!(&raw[0..8], &0x0102_0304_0506_0708_u64.to_le_bytes());
        assert_eq!(&raw[8..10], &[0x0B, 0x0A]);
        assert_eq!(BlockInfo::decode(&raw).expect("decode"), info);
    }

    #[test]
    fn block_map_rejects_ragged_length() {
        let map = vec![
            BlockInfo {
                block_id: BlockId(7),
                mac_id: MacId(1),
                version: Version(2),
            },
            BlockInfo {
                block_id: BlockId(9),
                mac_id: MacId(2),
                version: Version(1),
            },
        ];
        let mut raw = encode_block_map(&map);
        assert_eq!(decode_block_map(&raw).expect("decode"), map);
        raw.push(0);
        assert!(decode_block_map(&raw).is_err());
        assert!(decode_block_map(&[]).expect("empty").is_empty());
    }

    #[test]
    fn inode_type_bytes() {
        for ty in [InodeType::Unknown, InodeType::File, InodeType::Directory] {
            assert_eq!(InodeType::from_byte(ty.as_byte()), ty);
        }
        assert_eq!(InodeType::from_byte(0xFF), InodeType::Unknown);
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert_eq!(BlockSize::default().bits_per_block(), 32768);
    }

    #[test]
    fn version_bump_wraps() {
        assert_eq!(Version(u32::MAX).bumped(), Version(0));
        assert_eq!(Version(3).bumped(), Version(4));
    }
}
