//! Block mutation views.
//!
//! Allocators and the namespace never talk to a device directly when they
//! mutate; they go through a [`BlockIo`]. A [`DirectIo`] writes through and
//! syncs. A [`WriteSet`] is the pending write set of one transaction: writes
//! are staged in memory, reads see the staged content first, and nothing
//! reaches the device until the owner hands the staged operations to the
//! shadow log.

use crate::BlockDevice;
use dfs_error::{DfsError, Result};
use dfs_types::BlockId;
use std::collections::HashMap;
use tracing::trace;

/// A staged `{block_id, new_bytes}` mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOperation {
    pub block: BlockId,
    pub bytes: Vec<u8>,
}

/// Read/write view of a block device used by mutating code.
pub trait BlockIo {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    /// Read a full block as currently visible through this view.
    fn read(&self, block: BlockId) -> Result<Vec<u8>>;

    /// Replace a full block. `data.len()` must equal `block_size()`.
    fn write(&mut self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Overwrite part of a block.
    fn write_partial(&mut self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        let mut buf = self.read(block)?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                DfsError::InvalidArg(format!(
                    "partial write past block end: offset={offset} len={}",
                    data.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        self.write(block, &buf)
    }

    fn zero(&mut self, block: BlockId) -> Result<()> {
        let zeros = vec![0_u8; self.block_size() as usize];
        self.write(block, &zeros)
    }
}

/// Write-through view: every write is synced before it returns.
pub struct DirectIo<'a> {
    dev: &'a dyn BlockDevice,
}

impl<'a> DirectIo<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self { dev }
    }
}

impl BlockIo for DirectIo<'_> {
    fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    fn read(&self, block: BlockId) -> Result<Vec<u8>> {
        Ok(self.dev.read_block(block)?.into_inner())
    }

    fn write(&mut self, block: BlockId, data: &[u8]) -> Result<()> {
        self.dev.write_block(block, data)?;
        self.dev.sync()
    }

    fn write_partial(&mut self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        self.dev.write_partial_block(block, offset, data)?;
        self.dev.sync()
    }

    fn zero(&mut self, block: BlockId) -> Result<()> {
        self.dev.zero_block(block)?;
        self.dev.sync()
    }
}

/// Pending write set owned by one in-flight transaction.
///
/// Repeated writes to the same block coalesce into one operation that keeps
/// the position of the first write.
pub struct WriteSet<'a> {
    dev: &'a dyn BlockDevice,
    ops: Vec<BlockOperation>,
    index: HashMap<BlockId, usize>,
}

impl<'a> WriteSet<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self {
            dev,
            ops: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged content of `block`, if any.
    #[must_use]
    pub fn staged(&self, block: BlockId) -> Option<&[u8]> {
        self.index
            .get(&block)
            .map(|&idx| self.ops[idx].bytes.as_slice())
    }

    /// Drop every staged write.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.index.clear();
    }

    /// Consume the set, yielding operations in first-write order.
    #[must_use]
    pub fn into_ops(self) -> Vec<BlockOperation> {
        self.ops
    }
}

impl BlockIo for WriteSet<'_> {
    fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    fn read(&self, block: BlockId) -> Result<Vec<u8>> {
        if let Some(bytes) = self.staged(block) {
            return Ok(bytes.to_vec());
        }
        Ok(self.dev.read_block(block)?.into_inner())
    }

    fn write(&mut self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != self.dev.block_size() as usize {
            return Err(DfsError::InvalidArg(format!(
                "staged write size mismatch: got={} expected={}",
                data.len(),
                self.dev.block_size()
            )));
        }
        if block.0 >= self.dev.block_count() {
            return Err(DfsError::InvalidArg(format!(
                "staged write out of range: block={} block_count={}",
                block.0,
                self.dev.block_count()
            )));
        }
        trace!(block = block.0, "stage_write");
        match self.index.get(&block) {
            Some(&idx) => self.ops[idx].bytes.copy_from_slice(data),
            None => {
                self.index.insert(block, self.ops.len());
                self.ops.push(BlockOperation {
                    block,
                    bytes: data.to_vec(),
                });
            }
        }
        Ok(())
    }
}
