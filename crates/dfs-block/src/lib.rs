#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait with file and memory backends, the
//! `BlockIo` view used by allocators and the namespace, the pending
//! [`WriteSet`] that stages a transaction's mutations, and the striped
//! [`LockTable`].

mod fault;
mod stripe;
mod write_set;

pub use fault::FaultInjectingDevice;
pub use stripe::LockTable;
pub use write_set::{BlockIo, BlockOperation, DirectIo, WriteSet};

use dfs_error::{DfsError, Result};
use dfs_types::BlockId;
use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Always exactly one device block long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Flat byte store addressed by absolute offset.
pub trait ByteDevice: Send + Sync {
    /// Size of the store in bytes.
    fn len_bytes(&self) -> u64;

    /// Fill `buf` from `offset`; short reads are errors.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Store `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make every completed write durable.
    fn sync(&self) -> Result<()>;
}

fn checked_end(offset: u64, len: usize, len_bytes: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| DfsError::Invalid(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| DfsError::Invalid(format!("{what} range overflows u64")))?;
    if end > len_bytes {
        return Err(DfsError::Invalid(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={len_bytes}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positioned I/O.
///
/// Positioned reads and writes through `FileExt`, so concurrent callers never
/// share a cursor.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) an image of exactly `len` zero bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Volatile byte device. Sync is a no-op.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Copy of the full contents, for inspection in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_end(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| DfsError::Invalid("offset overflow".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_end(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| DfsError::Invalid("offset overflow".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Fixed-size block storage underneath every node.
pub trait BlockDevice: Send + Sync {
    /// Fetch block `block`.
    fn read_block(&self, block: BlockId) -> Result<BlockBuf>;

    /// Replace block `block`; `data` must be exactly one block long.
    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Overwrite `data.len()` bytes of a block starting at `offset`.
    ///
    /// The default is read-modify-write of the whole block.
    fn write_partial_block(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        let mut buf = self.read_block(block)?.into_inner();
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
        self.write_block(block, &buf)
    }

    /// Fill a block with zeros.
    fn zero_block(&self, block: BlockId) -> Result<()> {
        let zeros = vec![0_u8; self.block_size() as usize];
        self.write_block(block, &zeros)
    }

    /// Bytes per block.
    fn block_size(&self) -> u32;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Make every completed write durable.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn write_partial_block(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        (**self).write_partial_block(block, offset, data)
    }

    fn zero_block(&self, block: BlockId) -> Result<()> {
        (**self).zero_block(block)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(DfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(DfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockId) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(DfsError::InvalidArg(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| DfsError::Invalid("block offset overflow".to_owned()))
    }
}

impl ByteBlockDevice<MemByteDevice> {
    /// In-memory device of `block_count` zeroed blocks.
    pub fn memory(block_size: u32, block_count: u64) -> Result<Self> {
        let len = block_count
            .checked_mul(u64::from(block_size))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| DfsError::Format("memory device size overflows".to_owned()))?;
        Self::new(MemByteDevice::new(len), block_size)
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read_block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(DfsError::InvalidArg(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "write_block");
        Ok(())
    }

    fn write_partial_block(&self, block: BlockId, offset: usize, data: &[u8]) -> Result<()> {
        let within = offset
            .checked_add(data.len())
            .is_some_and(|end| end <= self.block_size as usize);
        if !within {
            return Err(DfsError::InvalidArg(format!(
                "partial write past block end: offset={offset} len={}",
                data.len()
            )));
        }
        let base = self.offset_of(block)?;
        self.inner.write_all_at(base + offset as u64, data)?;
        trace!(block = block.0, offset, len = data.len(), "write_partial_block");
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
