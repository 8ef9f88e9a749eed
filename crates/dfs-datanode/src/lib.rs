#![forbid(unsafe_code)]
//! Data node.
//!
//! Device layout:
//!
//! ```text
//! 0 .. version_blocks              u32 LE version per tracked block
//! version_blocks .. +bitmap_blocks allocation bitmap over [0, block_count)
//! ..block_count                    data blocks
//! ```
//!
//! A block's version is bumped and synced on every allocate and every free,
//! never on writes. A reader whose block-map entry carries an older version
//! than the stored one gets an empty reply and must refresh its map.
//!
//! `alloc_block`/`free_block` are serialized by one allocator mutex. Reads,
//! writes and version bumps of a block also hold that block's stripe of a
//! [`LockTable`], so a read never sees a half-bumped version. Lock order is
//! allocator, then block stripe.

use dfs_alloc::BitmapAllocator;
use dfs_block::{BlockDevice, ByteBlockDevice, DirectIo, LockTable, MemByteDevice};
use dfs_error::{DfsError, Result};
use dfs_rpc::DataService;
use dfs_types::{BlockId, BlockSize, DEFAULT_BLOCK_SIZE, Version, read_le_u32};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const VERSION_SIZE: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataNodeOptions {
    pub block_size: u32,
    /// Blocks tracked by the node, including the version table and bitmap.
    pub block_count: u64,
    pub lock_stripes: usize,
}

impl Default for DataNodeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 4096,
            lock_stripes: 64,
        }
    }
}

impl DataNodeOptions {
    pub fn validate(&self) -> Result<()> {
        BlockSize::new(self.block_size)
            .map_err(|err| DfsError::InvalidArg(format!("block_size: {err}")))?;
        if self.lock_stripes == 0 {
            return Err(DfsError::InvalidArg("lock_stripes must be positive".to_owned()));
        }
        let (version_blocks, bitmap_blocks) = self.reserved_blocks();
        if self.block_count <= version_blocks + bitmap_blocks {
            return Err(DfsError::Format(format!(
                "{} blocks leave no room for data after {version_blocks} version and {bitmap_blocks} bitmap blocks",
                self.block_count
            )));
        }
        Ok(())
    }

    fn reserved_blocks(&self) -> (u64, u64) {
        let bs = u64::from(self.block_size.max(1));
        let version_blocks = (self.block_count * VERSION_SIZE).div_ceil(bs);
        let bitmap_blocks = self.block_count.div_ceil(bs * 8);
        (version_blocks, bitmap_blocks)
    }
}

pub struct DataNode<D: BlockDevice> {
    dev: D,
    alloc: BitmapAllocator,
    alloc_lock: Mutex<()>,
    block_locks: LockTable,
}

impl DataNode<ByteBlockDevice<MemByteDevice>> {
    /// Fresh node on a zeroed in-memory device.
    pub fn in_memory(options: &DataNodeOptions) -> Result<Self> {
        options.validate()?;
        let dev = ByteBlockDevice::memory(options.block_size, options.block_count)?;
        Self::open(dev, options, true)
    }
}

impl<D: BlockDevice> DataNode<D> {
    /// Attach to `dev`. With `create` the version table is zeroed and the
    /// bitmap reset so that only the version table and bitmap are in use.
    pub fn open(dev: D, options: &DataNodeOptions, create: bool) -> Result<Self> {
        options.validate()?;
        if dev.block_size() != options.block_size {
            return Err(DfsError::Format(format!(
                "device block size {} does not match configured {}",
                dev.block_size(),
                options.block_size
            )));
        }
        let (version_blocks, _) = options.reserved_blocks();
        let mut io = DirectIo::new(&dev);
        let alloc = BitmapAllocator::open(
            &mut io,
            BlockId(version_blocks),
            0..options.block_count,
            create,
        )?;
        if create {
            for block in 0..version_blocks {
                dev.zero_block(BlockId(block))?;
            }
            dev.sync()?;
        }
        info!(
            block_count = options.block_count,
            version_blocks,
            bitmap_blocks = alloc.bitmap_blocks(),
            create,
            "datanode: opened"
        );
        Ok(Self {
            dev,
            alloc,
            alloc_lock: Mutex::new(()),
            block_locks: LockTable::new(options.lock_stripes),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn free_block_count(&self) -> Result<u64> {
        self.alloc.free_block_count(&DirectIo::new(&self.dev))
    }

    pub fn is_allocated(&self, block_id: BlockId) -> Result<bool> {
        self.alloc.is_allocated(&DirectIo::new(&self.dev), block_id)
    }

    /// Stored version of a tracked block.
    pub fn version_of(&self, block_id: BlockId) -> Result<Version> {
        if !self.alloc.contains(block_id) {
            return Err(DfsError::InvalidArg(format!(
                "block {block_id} outside this node"
            )));
        }
        let _stripe = self.block_locks.lock(block_id.0);
        self.read_version(block_id)
    }

    fn version_slot(&self, block_id: BlockId) -> (BlockId, usize) {
        let bs = u64::from(self.dev.block_size());
        let byte = block_id.0 * VERSION_SIZE;
        #[expect(clippy::cast_possible_truncation)] // remainder < block size
        let offset = (byte % bs) as usize;
        (BlockId(byte / bs), offset)
    }

    fn read_version(&self, block_id: BlockId) -> Result<Version> {
        let (block, offset) = self.version_slot(block_id);
        let buf = self.dev.read_block(block)?;
        let raw = read_le_u32(buf.as_slice(), offset)
            .map_err(|err| DfsError::corruption(block.0, err))?;
        Ok(Version(raw))
    }

    /// Bump and persist. Caller holds the block's stripe.
    fn bump_version(&self, block_id: BlockId) -> Result<Version> {
        let version = self.read_version(block_id)?.bumped();
        let (block, offset) = self.version_slot(block_id);
        self.dev
            .write_partial_block(block, offset, &version.0.to_le_bytes())?;
        self.dev.sync()?;
        Ok(version)
    }

    fn is_data_block(&self, block_id: BlockId) -> bool {
        self.alloc.contains(block_id) && !self.alloc.is_reserved(block_id)
    }
}

impl<D: BlockDevice> DataService for DataNode<D> {
    fn read_data(
        &self,
        block_id: BlockId,
        offset: u32,
        len: u32,
        version: Version,
    ) -> Result<Vec<u8>> {
        let bs = self.dev.block_size();
        if !self.is_data_block(block_id) || offset >= bs {
            return Ok(Vec::new());
        }
        let _stripe = self.block_locks.lock(block_id.0);
        if !self.alloc.is_allocated(&DirectIo::new(&self.dev), block_id)? {
            debug!(block = block_id.0, "datanode: read of free block");
            return Ok(Vec::new());
        }
        let stored = self.read_version(block_id)?;
        if stored > version {
            debug!(
                block = block_id.0,
                stored = stored.0,
                caller = version.0,
                "datanode: stale read"
            );
            return Ok(Vec::new());
        }
        let buf = self.dev.read_block(block_id)?;
        let start = offset as usize;
        let end = start + len.min(bs - offset) as usize;
        Ok(buf.as_slice()[start..end].to_vec())
    }

    fn write_data(&self, block_id: BlockId, offset: u32, bytes: &[u8]) -> Result<bool> {
        if !self.is_data_block(block_id) {
            return Err(DfsError::InvalidArg(format!(
                "block {block_id} is not a data block of this node"
            )));
        }
        let bs = self.dev.block_size() as usize;
        let start = offset as usize;
        if start.checked_add(bytes.len()).is_none_or(|end| end > bs) {
            return Err(DfsError::InvalidArg(format!(
                "write of {} bytes at offset {offset} exceeds block size {bs}",
                bytes.len()
            )));
        }
        let _stripe = self.block_locks.lock(block_id.0);
        self.dev.write_partial_block(block_id, start, bytes)?;
        self.dev.sync()?;
        Ok(true)
    }

    fn alloc_block(&self) -> Result<(BlockId, Version)> {
        let _alloc = self.alloc_lock.lock();
        let mut io = DirectIo::new(&self.dev);
        let block_id = self.alloc.allocate(&mut io)?;
        let _stripe = self.block_locks.lock(block_id.0);
        match self.bump_version(block_id) {
            Ok(version) => {
                debug!(block = block_id.0, version = version.0, "datanode: alloc_block");
                Ok((block_id, version))
            }
            Err(err) => {
                if let Err(undo) = self.alloc.deallocate(&mut io, block_id) {
                    warn!(block = block_id.0, error = %undo, "datanode: alloc rollback failed");
                }
                Err(err)
            }
        }
    }

    fn free_block(&self, block_id: BlockId) -> Result<bool> {
        self.alloc.check_releasable(block_id)?;
        let _alloc = self.alloc_lock.lock();
        let mut io = DirectIo::new(&self.dev);
        if !self.alloc.is_allocated(&io, block_id)? {
            debug!(block = block_id.0, "datanode: free of free block ignored");
            return Ok(true);
        }
        let _stripe = self.block_locks.lock(block_id.0);
        self.alloc.deallocate(&mut io, block_id)?;
        let version = self.bump_version(block_id)?;
        debug!(block = block_id.0, version = version.0, "datanode: free_block");
        Ok(true)
    }
}
