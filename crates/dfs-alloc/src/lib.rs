#![forbid(unsafe_code)]
//! Bitmap block allocation.
//!
//! ## Design
//!
//! A [`BitmapAllocator`] tracks a contiguous run of blocks, one bit per
//! block, packed across one or more bitmap blocks. It holds geometry only;
//! the bits live on the device and are read and written through a
//! [`BlockIo`], so callers decide whether a mutation is applied directly or
//! staged in a transaction's [`dfs_block::WriteSet`].
//!
//! When the bitmap itself lives inside the tracked run, every block from the
//! start of the run through the end of the bitmap is pre-marked allocated
//! at creation. That prefix is the reserved region (superblocks, version
//! tables, the bitmap) and can never be handed out or freed.
//!
//! The final bitmap block only covers the remainder of the tracked run;
//! scans and counts on it are bounded by that remainder, never by the full
//! bit capacity of a block.

use dfs_block::BlockIo;
use dfs_error::{DfsError, Result};
use dfs_types::BlockId;
use std::ops::Range;
use tracing::{debug, info, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let full_bytes = (count / 8) as usize;
    let first_byte = (start / 8) as usize;
    // Skip whole bytes that are fully allocated.
    for byte_idx in first_byte..full_bytes.min(bitmap.len()) {
        let byte = bitmap[byte_idx];
        if byte == 0xFF {
            continue;
        }
        for bit in 0..8 {
            #[expect(clippy::cast_possible_truncation)] // byte_idx < count / 8
            let idx = (byte_idx as u32) * 8 + bit;
            if idx >= start && (byte >> bit) & 1 == 0 {
                return Some(idx);
            }
        }
    }
    let tail_start = (full_bytes as u32 * 8).max(start);
    (tail_start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Geometry of one bitmap-tracked block run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapAllocator {
    bitmap_start: u64,
    bitmap_blocks: u64,
    tracked_start: u64,
    tracked_count: u64,
    bits_per_block: u64,
    reserved_end: u64,
}

impl BitmapAllocator {
    /// Compute and validate the geometry without touching the device.
    pub fn layout(
        block_size: u32,
        device_blocks: u64,
        bitmap_start: BlockId,
        tracked: Range<u64>,
    ) -> Result<Self> {
        if tracked.start >= tracked.end {
            return Err(DfsError::Format(format!(
                "empty tracked range {}..{}",
                tracked.start, tracked.end
            )));
        }
        if tracked.end > device_blocks {
            return Err(DfsError::Format(format!(
                "tracked range end {} exceeds device block count {device_blocks}",
                tracked.end
            )));
        }
        let bits_per_block = u64::from(block_size) * 8;
        let tracked_count = tracked.end - tracked.start;
        let bitmap_blocks = tracked_count.div_ceil(bits_per_block);
        let bitmap_end = bitmap_start
            .0
            .checked_add(bitmap_blocks)
            .filter(|end| *end <= device_blocks)
            .ok_or_else(|| {
                DfsError::Format(format!(
                    "bitmap of {bitmap_blocks} blocks at {} does not fit in {device_blocks} blocks",
                    bitmap_start.0
                ))
            })?;

        let reserved_end = if tracked.contains(&bitmap_start.0) {
            if bitmap_end > tracked.end {
                return Err(DfsError::Format(format!(
                    "bitmap {}..{bitmap_end} straddles tracked range end {}",
                    bitmap_start.0, tracked.end
                )));
            }
            bitmap_end
        } else {
            if bitmap_start.0 < tracked.start && bitmap_end > tracked.start {
                return Err(DfsError::Format(format!(
                    "bitmap {}..{bitmap_end} overlaps tracked range start {}",
                    bitmap_start.0, tracked.start
                )));
            }
            tracked.start
        };

        Ok(Self {
            bitmap_start: bitmap_start.0,
            bitmap_blocks,
            tracked_start: tracked.start,
            tracked_count,
            bits_per_block,
            reserved_end,
        })
    }

    /// Attach to the bitmap at `bitmap_start` tracking `tracked`.
    ///
    /// With `create`, the bitmap blocks are zeroed and the reserved prefix is
    /// marked allocated.
    pub fn open(
        io: &mut dyn BlockIo,
        bitmap_start: BlockId,
        tracked: Range<u64>,
        create: bool,
    ) -> Result<Self> {
        let alloc = Self::layout(io.block_size(), io.block_count(), bitmap_start, tracked)?;
        if create {
            alloc.reset(io)?;
            info!(
                bitmap_start = alloc.bitmap_start,
                bitmap_blocks = alloc.bitmap_blocks,
                tracked_start = alloc.tracked_start,
                tracked_count = alloc.tracked_count,
                reserved_end = alloc.reserved_end,
                "bitmap_alloc: created"
            );
        }
        Ok(alloc)
    }

    /// Rewrite the bitmap so only the reserved prefix is allocated.
    pub fn reset(&self, io: &mut dyn BlockIo) -> Result<()> {
        for idx in 0..self.bitmap_blocks {
            let mut bits = vec![0_u8; io.block_size() as usize];
            let first = self.tracked_start + idx * self.bits_per_block;
            let last = first + u64::from(self.bits_in(idx));
            for id in first..last.min(self.reserved_end) {
                bitmap_set(&mut bits, self.local_bit(id));
            }
            io.write(BlockId(self.bitmap_start + idx), &bits)?;
        }
        Ok(())
    }

    /// Claim the first free block.
    ///
    /// The modified bitmap block is written through `io`; when `io` is a
    /// write set nothing reaches the device until the set is applied.
    pub fn allocate(&self, io: &mut dyn BlockIo) -> Result<BlockId> {
        for idx in 0..self.bitmap_blocks {
            let block = BlockId(self.bitmap_start + idx);
            let mut bits = io.read(block)?;
            if let Some(bit) = bitmap_find_free(&bits, self.bits_in(idx), 0) {
                bitmap_set(&mut bits, bit);
                io.write(block, &bits)?;
                let id = BlockId(self.tracked_start + idx * self.bits_per_block + u64::from(bit));
                trace!(block = id.0, "bitmap_alloc: allocate");
                return Ok(id);
            }
        }
        debug!(
            tracked_count = self.tracked_count,
            "bitmap_alloc: exhausted"
        );
        Err(DfsError::OutOfResource)
    }

    /// Release `id`, staging the bitmap update and a zero-fill of the block.
    ///
    /// Out-of-range ids, reserved ids and double frees fail with
    /// `InvalidArg` before anything is written.
    pub fn deallocate(&self, io: &mut dyn BlockIo, id: BlockId) -> Result<()> {
        self.check_releasable(id)?;
        let (block, bit) = self.locate(id);
        let mut bits = io.read(block)?;
        if !bitmap_get(&bits, bit) {
            return Err(DfsError::InvalidArg(format!(
                "double free: block {id} is not allocated"
            )));
        }
        bitmap_clear(&mut bits, bit);
        io.write(block, &bits)?;
        io.zero(id)?;
        trace!(block = id.0, "bitmap_alloc: deallocate");
        Ok(())
    }

    /// Number of free blocks in the tracked run.
    pub fn free_block_count(&self, io: &dyn BlockIo) -> Result<u64> {
        let mut free = 0_u64;
        for idx in 0..self.bitmap_blocks {
            let bits = io.read(BlockId(self.bitmap_start + idx))?;
            free += u64::from(bitmap_count_free(&bits, self.bits_in(idx)));
        }
        Ok(free)
    }

    pub fn is_allocated(&self, io: &dyn BlockIo, id: BlockId) -> Result<bool> {
        if !self.contains(id) {
            return Err(DfsError::InvalidArg(format!(
                "block {id} outside tracked range"
            )));
        }
        let (block, bit) = self.locate(id);
        Ok(bitmap_get(&io.read(block)?, bit))
    }

    /// Validate that `id` is a block this allocator may free.
    pub fn check_releasable(&self, id: BlockId) -> Result<()> {
        if !self.contains(id) {
            return Err(DfsError::InvalidArg(format!(
                "block {id} outside tracked range {}..{}",
                self.tracked_start,
                self.tracked_end()
            )));
        }
        if self.is_reserved(id) {
            return Err(DfsError::InvalidArg(format!(
                "block {id} is reserved (below {})",
                self.reserved_end
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        (self.tracked_start..self.tracked_end()).contains(&id.0)
    }

    #[must_use]
    pub fn is_reserved(&self, id: BlockId) -> bool {
        (self.tracked_start..self.reserved_end).contains(&id.0)
    }

    #[must_use]
    pub fn bitmap_start(&self) -> BlockId {
        BlockId(self.bitmap_start)
    }

    #[must_use]
    pub fn bitmap_blocks(&self) -> u64 {
        self.bitmap_blocks
    }

    #[must_use]
    pub fn bitmap_end(&self) -> BlockId {
        BlockId(self.bitmap_start + self.bitmap_blocks)
    }

    #[must_use]
    pub fn tracked_start(&self) -> BlockId {
        BlockId(self.tracked_start)
    }

    #[must_use]
    pub fn tracked_end(&self) -> u64 {
        self.tracked_start + self.tracked_count
    }

    #[must_use]
    pub fn tracked_count(&self) -> u64 {
        self.tracked_count
    }

    /// First block that may ever be allocated.
    #[must_use]
    pub fn reserved_end(&self) -> BlockId {
        BlockId(self.reserved_end)
    }

    /// Valid bit count of bitmap block `idx`.
    #[expect(clippy::cast_possible_truncation)] // bounded by bits_per_block, which came from a u32
    fn bits_in(&self, idx: u64) -> u32 {
        let covered = idx * self.bits_per_block;
        self.bits_per_block
            .min(self.tracked_count.saturating_sub(covered)) as u32
    }

    #[expect(clippy::cast_possible_truncation)] // remainder < bits_per_block
    fn local_bit(&self, id: u64) -> u32 {
        ((id - self.tracked_start) % self.bits_per_block) as u32
    }

    fn locate(&self, id: BlockId) -> (BlockId, u32) {
        let idx = (id.0 - self.tracked_start) / self.bits_per_block;
        (BlockId(self.bitmap_start + idx), self.local_bit(id.0))
    }
}
