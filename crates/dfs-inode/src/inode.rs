//! On-disk inode block.
//!
//! ```text
//! +------------------+--------+
//! | type             | 1 byte | InodeType byte
//! | reserved         | 7 bytes|
//! | content_len      | 8 bytes| bytes of directory text / block map
//! | size             | 8 bytes| logical file size
//! | atime            | 8 bytes|
//! | mtime            | 8 bytes|
//! | ctime            | 8 bytes|
//! | nblocks          | 4 bytes|
//! | reserved         | 4 bytes|
//! | block pointers   | 8 bytes each, nblocks of them
//! +------------------+--------+
//! ```

use dfs_error::{DfsError, Result};
use dfs_types::{
    BLOCK_INFO_SIZE, BlockId, FileAttr, InodeType, ParseError, read_le_u32, read_le_u64,
};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const INODE_HEADER_SIZE: usize = 56;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub ty: InodeType,
    pub content_len: u64,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub blocks: Vec<BlockId>,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl Inode {
    #[must_use]
    pub fn new(ty: InodeType) -> Self {
        let now = now_secs();
        Self {
            ty,
            content_len: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            blocks: Vec::new(),
        }
    }

    /// Pointer slots available in one inode block.
    #[must_use]
    pub fn max_blocks(block_size: usize) -> usize {
        block_size.saturating_sub(INODE_HEADER_SIZE) / 8
    }

    /// Largest block map a file inode can hold, in entries.
    #[must_use]
    pub fn max_map_entries(block_size: usize) -> usize {
        Self::max_blocks(block_size) * block_size / BLOCK_INFO_SIZE
    }

    /// Attributes as reported to clients. Directories report their content
    /// length; files report the logical size.
    #[must_use]
    pub fn attr(&self) -> FileAttr {
        let size = match self.ty {
            InodeType::Directory => self.content_len,
            InodeType::File | InodeType::Unknown => self.size,
        };
        FileAttr {
            size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        if self.blocks.len() > Self::max_blocks(block_size) {
            return Err(DfsError::OutOfResource);
        }
        let nblocks = u32::try_from(self.blocks.len())
            .map_err(|_| DfsError::InvalidArg("too many inode blocks".to_owned()))?;
        let mut buf = vec![0_u8; block_size];
        buf[0] = self.ty.as_byte();
        buf[8..16].copy_from_slice(&self.content_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.atime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.mtime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ctime.to_le_bytes());
        buf[48..52].copy_from_slice(&nblocks.to_le_bytes());
        for (idx, block) in self.blocks.iter().enumerate() {
            let at = INODE_HEADER_SIZE + idx * 8;
            buf[at..at + 8].copy_from_slice(&block.0.to_le_bytes());
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8], at: BlockId) -> Result<Self> {
        let corrupt = |err: ParseError| DfsError::corruption(at.0, err);
        let ty = InodeType::from_byte(bytes.first().copied().unwrap_or(0));
        if ty == InodeType::Unknown {
            return Err(DfsError::corruption(at.0, "inode block has no type"));
        }
        let nblocks = read_le_u32(bytes, 48).map_err(corrupt)? as usize;
        if nblocks > Self::max_blocks(bytes.len()) {
            return Err(DfsError::corruption(
                at.0,
                format!("inode claims {nblocks} blocks"),
            ));
        }
        let blocks = (0..nblocks)
            .map(|idx| read_le_u64(bytes, INODE_HEADER_SIZE + idx * 8).map(BlockId))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(corrupt)?;
        Ok(Self {
            ty,
            content_len: read_le_u64(bytes, 8).map_err(corrupt)?,
            size: read_le_u64(bytes, 16).map_err(corrupt)?,
            atime: read_le_u64(bytes, 24).map_err(corrupt)?,
            mtime: read_le_u64(bytes, 32).map_err(corrupt)?,
            ctime: read_le_u64(bytes, 40).map_err(corrupt)?,
            blocks,
        })
    }
}
