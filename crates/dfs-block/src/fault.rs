//! Fault injection for crash-consistency tests.

use crate::{BlockBuf, BlockDevice};
use dfs_error::{DfsError, Result};
use dfs_types::BlockId;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Block device wrapper that fails writes to a configurable block range.
///
/// Reads always pass through, so a test can stop the world at an exact
/// point (e.g. after a commit marker is durable but before targets are
/// written), then [`heal`](Self::heal) and reopen on the same image.
#[derive(Debug)]
pub struct FaultInjectingDevice<D> {
    inner: D,
    failing: Mutex<Option<Range<u64>>>,
    writes: AtomicU64,
}

impl<D: BlockDevice> FaultInjectingDevice<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            failing: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }

    /// Fail every subsequent write to a block in `range`.
    pub fn fail_writes_in(&self, range: Range<u64>) {
        *self.failing.lock() = Some(range);
    }

    pub fn heal(&self) {
        *self.failing.lock() = None;
    }

    /// Successful block writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn check(&self, block: BlockId) -> Result<()> {
        if let Some(range) = self.failing.lock().as_ref() {
            if range.contains(&block.0) {
                return Err(DfsError::Invalid(format!(
                    "injected write failure at block {}",
                    block.0
                )));
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for FaultInjectingDevice<D> {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        self.check(block)?;
        self.inner.write_block(block, data)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_partial_block(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        self.check(block)?;
        self.inner.write_partial_block(block, offset, data)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
