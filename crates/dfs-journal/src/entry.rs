//! Log entry codec and log-region geometry.
//!
//! # Format
//!
//! ```text
//! Log region (log_blocks blocks starting at log_start):
//! +-----------------+
//! | entry array     |  meta_blocks, LOG_ENTRY_SIZE-byte slots, packed
//! +-----------------+
//! | shadow bitmap   |  one bit per shadow block
//! +-----------------+
//! | shadow blocks   |  staged copies of target content
//! +-----------------+
//!
//! LogEntry:
//! +------------------+--------+
//! | txn_id           | 8 bytes| 0 = unused slot, terminates the array
//! | target_block     | 8 bytes|
//! | shadow_block     | 8 bytes|
//! | shadow_crc32c    | 4 bytes| CRC32c of the shadow block content
//! | reserved         | 4 bytes| = 0
//! +------------------+--------+
//! ```
//!
//! An entry with target and shadow both 0 is the commit marker of its txn.

use dfs_error::{DfsError, Result};
use dfs_types::{BlockId, ParseError, TxnId, read_le_u32, read_le_u64};

/// Encoded size of one [`LogEntry`].
pub const LOG_ENTRY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogEntry {
    pub txn: TxnId,
    pub target: BlockId,
    pub shadow: BlockId,
    pub checksum: u32,
}

impl LogEntry {
    #[must_use]
    pub fn marker(txn: TxnId) -> Self {
        Self {
            txn,
            target: BlockId(0),
            shadow: BlockId(0),
            checksum: 0,
        }
    }

    #[must_use]
    pub fn is_commit_marker(&self) -> bool {
        self.target.0 == 0 && self.shadow.0 == 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; LOG_ENTRY_SIZE] {
        let mut buf = [0_u8; LOG_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.txn.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.target.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.shadow.0.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode a slot. `None` for an unused (all-zero txn) slot.
    pub fn decode(bytes: &[u8], block: BlockId) -> Result<Option<Self>> {
        let field = |res: std::result::Result<u64, ParseError>| {
            res.map_err(|err| DfsError::corruption(block.0, err))
        };
        let txn = field(read_le_u64(bytes, 0))?;
        if txn == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            txn: TxnId(txn),
            target: BlockId(field(read_le_u64(bytes, 8))?),
            shadow: BlockId(field(read_le_u64(bytes, 16))?),
            checksum: read_le_u32(bytes, 24).map_err(|err| DfsError::corruption(block.0, err))?,
        }))
    }
}

/// Block ranges of the log region, derived from its size at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLayout {
    pub log_start: u64,
    pub log_blocks: u64,
    pub entries_per_block: u64,
    pub meta_blocks: u64,
    pub bitmap_start: u64,
    pub bitmap_blocks: u64,
    pub data_start: u64,
    pub data_blocks: u64,
}

impl LogLayout {
    pub fn new(block_size: u32, log_start: u64, log_blocks: u64) -> Result<Self> {
        let entries_per_block = u64::from(block_size) / LOG_ENTRY_SIZE as u64;
        if entries_per_block == 0 {
            return Err(DfsError::Format(format!(
                "block size {block_size} cannot hold a log entry"
            )));
        }
        // One slot per log block bounds the array: every non-marker entry owns
        // a distinct shadow block.
        let meta_blocks = log_blocks.div_ceil(entries_per_block).max(1);
        let remaining = log_blocks.saturating_sub(meta_blocks);
        let bits_per_block = u64::from(block_size) * 8;
        let bitmap_blocks = remaining.div_ceil(bits_per_block + 1);
        let data_blocks = remaining.saturating_sub(bitmap_blocks);
        if data_blocks == 0 {
            return Err(DfsError::Format(format!(
                "log of {log_blocks} blocks leaves no room for shadow blocks"
            )));
        }
        let bitmap_start = log_start
            .checked_add(meta_blocks)
            .ok_or_else(|| DfsError::Format("log region overflows".to_owned()))?;
        Ok(Self {
            log_start,
            log_blocks,
            entries_per_block,
            meta_blocks,
            bitmap_start,
            bitmap_blocks,
            data_start: bitmap_start + bitmap_blocks,
            data_blocks,
        })
    }

    #[must_use]
    pub fn log_end(&self) -> u64 {
        self.log_start + self.log_blocks
    }

    /// Entry slots available in the array.
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::try_from(self.meta_blocks * self.entries_per_block).unwrap_or(usize::MAX)
    }

    /// Meta block and byte offset of entry slot `slot`.
    #[must_use]
    pub fn slot_position(&self, slot: usize) -> (BlockId, usize) {
        let slot = slot as u64;
        let block = BlockId(self.log_start + slot / self.entries_per_block);
        #[expect(clippy::cast_possible_truncation)] // < entries_per_block * 32 <= block size
        let offset = ((slot % self.entries_per_block) as usize) * LOG_ENTRY_SIZE;
        (block, offset)
    }

    #[must_use]
    pub fn contains(&self, block: BlockId) -> bool {
        (self.log_start..self.log_end()).contains(&block.0)
    }

    #[must_use]
    pub fn is_shadow(&self, block: BlockId) -> bool {
        (self.data_start..self.log_end()).contains(&block.0)
    }
}
