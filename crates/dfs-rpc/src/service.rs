//! Typed service interfaces.
//!
//! Errors are typed here. Wire sentinels (inode 0) only exist between
//! [`crate::Endpoint`] and the client stubs.

use dfs_dir::DirEntry;
use dfs_error::Result;
use dfs_types::{BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId, Version};

pub trait DataService: Send + Sync {
    /// Up to `len` bytes at `offset`. Empty when the block is out of range
    /// or not allocated, the offset is past the block, or the stored version
    /// is newer than `version`.
    fn read_data(&self, block_id: BlockId, offset: u32, len: u32, version: Version)
    -> Result<Vec<u8>>;

    fn write_data(&self, block_id: BlockId, offset: u32, bytes: &[u8]) -> Result<bool>;

    fn alloc_block(&self) -> Result<(BlockId, Version)>;

    fn free_block(&self, block_id: BlockId) -> Result<bool>;
}

/// Namespace and block-map operations of the metadata node.
///
/// A mutating call that fails with a device error (`Io`/`Invalid`) may
/// still have reached its commit point. Such a mutation is not visible yet
/// but becomes visible once the node's next transaction or checkpoint
/// applies it, so callers re-check with `lookup` or `get_block_map` before
/// retrying. Every other error means nothing changed.
pub trait MetadataService: Send + Sync {
    fn mknode(&self, ty: InodeType, parent: InodeId, name: &str) -> Result<InodeId>;

    fn unlink(&self, parent: InodeId, name: &str) -> Result<bool>;

    fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId>;

    fn readdir(&self, inode: InodeId) -> Result<Vec<DirEntry>>;

    fn get_type_attr(&self, inode: InodeId) -> Result<(InodeType, FileAttr)>;

    fn get_block_map(&self, inode: InodeId) -> Result<Vec<BlockInfo>>;

    fn alloc_block(&self, inode: InodeId) -> Result<BlockInfo>;

    fn free_block(&self, inode: InodeId, block_id: BlockId, mac_id: MacId) -> Result<bool>;

    /// Raise the logical size to at least `end`; returns the new size.
    fn extend_size(&self, inode: InodeId, end: u64) -> Result<u64>;
}
