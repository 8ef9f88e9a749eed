#![forbid(unsafe_code)]
//! Inode management and the directory namespace of the metadata node.
//!
//! Device layout (user region of the metadata device):
//!
//! ```text
//! block 0                      superblock
//! 1 .. 1+itable_blocks         inode table: u64 per inode id -> inode block (0 = free)
//! bitmap_start ..              allocation bitmap over [0, user_blocks)
//! ..user_blocks                inode blocks and content blocks
//! ```
//!
//! Everything up to the end of the bitmap is reserved by the allocator.
//! A [`Namespace`] carries geometry only. All reads and writes go through
//! a [`BlockIo`], so a mutation performed against a transaction's write set
//! stays invisible until the set is logged and committed.

mod inode;

pub use inode::Inode;

use dfs_alloc::BitmapAllocator;
use dfs_block::BlockIo;
use dfs_dir::{DirEntry, append_to_directory, find_entry, parse_directory, rm_from_directory};
use dfs_error::{DfsError, Result};
use dfs_types::{BlockId, FileAttr, InodeId, InodeType, read_le_u32, read_le_u64};
use tracing::{debug, info};

/// Superblock magic ("DFSMETA1").
pub const META_MAGIC: u64 = 0x3141_5445_4D53_4644;

const INODE_TABLE_START: u64 = 1;
const TABLE_SLOT_SIZE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    block_size: u32,
    user_blocks: u64,
    max_inodes: u64,
    itable_blocks: u64,
    alloc: BitmapAllocator,
}

impl Namespace {
    fn layout(io: &dyn BlockIo, user_blocks: u64, max_inodes: u64) -> Result<Self> {
        if max_inodes == 0 {
            return Err(DfsError::Format("max_inodes must be positive".to_owned()));
        }
        let block_size = u64::from(io.block_size());
        let itable_blocks = (max_inodes + 1)
            .checked_mul(TABLE_SLOT_SIZE)
            .ok_or_else(|| DfsError::Format("inode table size overflows".to_owned()))?
            .div_ceil(block_size);
        let bitmap_start = BlockId(INODE_TABLE_START + itable_blocks);
        let alloc =
            BitmapAllocator::layout(io.block_size(), io.block_count(), bitmap_start, 0..user_blocks)?;
        if alloc.reserved_end() != alloc.bitmap_end() {
            return Err(DfsError::Format(format!(
                "user region of {user_blocks} blocks cannot hold the inode table and bitmap"
            )));
        }
        Ok(Self {
            block_size: io.block_size(),
            user_blocks,
            max_inodes,
            itable_blocks,
            alloc,
        })
    }

    /// Lay out a fresh namespace with an empty root directory.
    pub fn format(io: &mut dyn BlockIo, user_blocks: u64, max_inodes: u64) -> Result<Self> {
        let ns = Self::layout(io, user_blocks, max_inodes)?;
        for idx in 0..ns.itable_blocks {
            io.zero(BlockId(INODE_TABLE_START + idx))?;
        }
        BitmapAllocator::open(io, ns.alloc.bitmap_start(), 0..user_blocks, true)?;
        let root = ns.alloc_inode(io, InodeType::Directory)?;
        if root != InodeId::ROOT {
            return Err(DfsError::Format(format!(
                "root directory landed on inode {root}"
            )));
        }
        // Superblock last: a torn format is not mistaken for a valid one.
        io.write(BlockId(0), &ns.encode_superblock())?;
        info!(
            user_blocks,
            max_inodes,
            itable_blocks = ns.itable_blocks,
            bitmap_start = ns.alloc.bitmap_start().0,
            "namespace: formatted"
        );
        Ok(ns)
    }

    /// Attach to a formatted namespace.
    pub fn open(io: &dyn BlockIo) -> Result<Self> {
        let sb = io.read(BlockId(0))?;
        let field = |offset| read_le_u64(&sb, offset).map_err(|err| DfsError::corruption(0, err));
        let magic = field(0)?;
        if magic != META_MAGIC {
            return Err(DfsError::Format(format!(
                "metadata magic mismatch: expected {META_MAGIC:#x}, got {magic:#x}"
            )));
        }
        let block_size = read_le_u32(&sb, 8).map_err(|err| DfsError::corruption(0, err))?;
        if block_size != io.block_size() {
            return Err(DfsError::Format(format!(
                "metadata block size {block_size} does not match device block size {}",
                io.block_size()
            )));
        }
        let ns = Self::layout(io, field(16)?, field(24)?)?;
        if field(32)? != INODE_TABLE_START
            || field(40)? != ns.itable_blocks
            || field(48)? != ns.alloc.bitmap_start().0
        {
            return Err(DfsError::corruption(0, "superblock geometry is inconsistent"));
        }
        Ok(ns)
    }

    pub fn is_formatted(io: &dyn BlockIo) -> Result<bool> {
        let sb = io.read(BlockId(0))?;
        Ok(read_le_u64(&sb, 0).is_ok_and(|magic| magic == META_MAGIC))
    }

    fn encode_superblock(&self) -> Vec<u8> {
        let mut sb = vec![0_u8; self.bs()];
        sb[0..8].copy_from_slice(&META_MAGIC.to_le_bytes());
        sb[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        sb[16..24].copy_from_slice(&self.user_blocks.to_le_bytes());
        sb[24..32].copy_from_slice(&self.max_inodes.to_le_bytes());
        sb[32..40].copy_from_slice(&INODE_TABLE_START.to_le_bytes());
        sb[40..48].copy_from_slice(&self.itable_blocks.to_le_bytes());
        sb[48..56].copy_from_slice(&self.alloc.bitmap_start().0.to_le_bytes());
        sb
    }

    fn bs(&self) -> usize {
        self.block_size as usize
    }

    #[must_use]
    pub fn allocator(&self) -> &BitmapAllocator {
        &self.alloc
    }

    #[must_use]
    pub fn user_blocks(&self) -> u64 {
        self.user_blocks
    }

    #[must_use]
    pub fn max_inodes(&self) -> u64 {
        self.max_inodes
    }

    pub fn free_block_count(&self, io: &dyn BlockIo) -> Result<u64> {
        self.alloc.free_block_count(io)
    }

    // ── Inode table ─────────────────────────────────────────────────────

    fn table_position(&self, id: InodeId) -> Result<(BlockId, usize)> {
        if id.0 == 0 || id.0 > self.max_inodes {
            return Err(DfsError::InvalidArg(format!("inode {id} out of range")));
        }
        let byte = id.0 * TABLE_SLOT_SIZE;
        let bs = u64::from(self.block_size);
        #[expect(clippy::cast_possible_truncation)] // remainder < block size
        let offset = (byte % bs) as usize;
        Ok((BlockId(INODE_TABLE_START + byte / bs), offset))
    }

    fn inode_block(&self, io: &dyn BlockIo, id: InodeId) -> Result<BlockId> {
        let (block, offset) = self.table_position(id)?;
        let buf = io.read(block)?;
        let ptr = read_le_u64(&buf, offset).map_err(|err| DfsError::corruption(block.0, err))?;
        if ptr == 0 {
            return Err(DfsError::NotExist);
        }
        Ok(BlockId(ptr))
    }

    fn set_inode_block(&self, io: &mut dyn BlockIo, id: InodeId, ptr: u64) -> Result<()> {
        let (block, offset) = self.table_position(id)?;
        io.write_partial(block, offset, &ptr.to_le_bytes())
    }

    fn free_inode_slot(&self, io: &dyn BlockIo) -> Result<InodeId> {
        let per_block = u64::from(self.block_size) / TABLE_SLOT_SIZE;
        for idx in 0..self.itable_blocks {
            let buf = io.read(BlockId(INODE_TABLE_START + idx))?;
            for (pos, slot) in buf.chunks_exact(8).enumerate() {
                let id = idx * per_block + pos as u64;
                if id == 0 || id > self.max_inodes {
                    continue;
                }
                if slot.iter().all(|byte| *byte == 0) {
                    return Ok(InodeId(id));
                }
            }
        }
        Err(DfsError::OutOfResource)
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// Create an empty inode of type `ty`.
    pub fn alloc_inode(&self, io: &mut dyn BlockIo, ty: InodeType) -> Result<InodeId> {
        let id = self.free_inode_slot(io)?;
        let block = self.alloc.allocate(io)?;
        io.write(block, &Inode::new(ty).encode(self.bs())?)?;
        self.set_inode_block(io, id, block.0)?;
        debug!(inode = id.0, block = block.0, ?ty, "namespace: alloc_inode");
        Ok(id)
    }

    /// Release an inode, its content blocks and its table slot.
    pub fn free_inode(&self, io: &mut dyn BlockIo, id: InodeId) -> Result<()> {
        let block = self.inode_block(io, id)?;
        let inode = Inode::decode(&io.read(block)?, block)?;
        for content in &inode.blocks {
            self.alloc.deallocate(io, *content)?;
        }
        self.alloc.deallocate(io, block)?;
        self.set_inode_block(io, id, 0)?;
        debug!(inode = id.0, blocks = inode.blocks.len(), "namespace: free_inode");
        Ok(())
    }

    pub fn read_inode(&self, io: &dyn BlockIo, id: InodeId) -> Result<Inode> {
        let block = self.inode_block(io, id)?;
        Inode::decode(&io.read(block)?, block)
    }

    fn write_inode(&self, io: &mut dyn BlockIo, id: InodeId, inode: &Inode) -> Result<()> {
        let block = self.inode_block(io, id)?;
        io.write(block, &inode.encode(self.bs())?)
    }

    pub fn get_type_attr(&self, io: &dyn BlockIo, id: InodeId) -> Result<(InodeType, FileAttr)> {
        let inode = self.read_inode(io, id)?;
        Ok((inode.ty, inode.attr()))
    }

    /// Full content of an inode (directory text or packed block map).
    pub fn read_file(&self, io: &dyn BlockIo, id: InodeId) -> Result<Vec<u8>> {
        let inode = self.read_inode(io, id)?;
        self.read_content(io, &inode)
    }

    fn read_content(&self, io: &dyn BlockIo, inode: &Inode) -> Result<Vec<u8>> {
        let len = usize::try_from(inode.content_len)
            .map_err(|_| DfsError::InvalidArg("content length overflows usize".to_owned()))?;
        let mut out = Vec::with_capacity(len);
        for block in &inode.blocks {
            out.extend_from_slice(&io.read(*block)?);
        }
        if out.len() < len {
            return Err(DfsError::Corruption {
                block: inode.blocks.last().map_or(0, |block| block.0),
                detail: format!(
                    "content length {len} exceeds {} allocated bytes",
                    out.len()
                ),
            });
        }
        out.truncate(len);
        Ok(out)
    }

    /// Replace an inode's content, growing or shrinking its block list.
    pub fn write_file(&self, io: &mut dyn BlockIo, id: InodeId, content: &[u8]) -> Result<()> {
        let mut inode = self.read_inode(io, id)?;
        self.write_content(io, &mut inode, content)?;
        self.write_inode(io, id, &inode)
    }

    fn write_content(&self, io: &mut dyn BlockIo, inode: &mut Inode, content: &[u8]) -> Result<()> {
        let bs = self.bs();
        let needed = content.len().div_ceil(bs);
        if needed > Inode::max_blocks(bs) {
            return Err(DfsError::OutOfResource);
        }
        while inode.blocks.len() < needed {
            inode.blocks.push(self.alloc.allocate(io)?);
        }
        while inode.blocks.len() > needed {
            if let Some(block) = inode.blocks.pop() {
                self.alloc.deallocate(io, block)?;
            }
        }
        for (block, chunk) in inode.blocks.iter().zip(content.chunks(bs)) {
            let mut padded = chunk.to_vec();
            padded.resize(bs, 0);
            if io.read(*block)? != padded {
                io.write(*block, &padded)?;
            }
        }
        inode.content_len = content.len() as u64;
        let now = inode::now_secs();
        inode.mtime = now;
        inode.ctime = now;
        Ok(())
    }

    /// Record the logical byte size of a file.
    pub fn set_size(&self, io: &mut dyn BlockIo, id: InodeId, size: u64) -> Result<()> {
        let mut inode = self.read_inode(io, id)?;
        inode.size = size;
        inode.ctime = inode::now_secs();
        self.write_inode(io, id, &inode)
    }

    // ── Directories ─────────────────────────────────────────────────────

    fn read_dir(&self, io: &dyn BlockIo, id: InodeId) -> Result<(Inode, String)> {
        let inode = self.read_inode(io, id)?;
        if inode.ty != InodeType::Directory {
            return Err(DfsError::InvalidArg(format!("inode {id} is not a directory")));
        }
        let content = self.read_content(io, &inode)?;
        let text = String::from_utf8(content)
            .map_err(|err| DfsError::Format(format!("directory content is not UTF-8: {err}")))?;
        Ok((inode, text))
    }

    pub fn readdir(&self, io: &dyn BlockIo, id: InodeId) -> Result<Vec<DirEntry>> {
        let (_, text) = self.read_dir(io, id)?;
        parse_directory(text.as_bytes())
    }

    pub fn lookup(&self, io: &dyn BlockIo, parent: InodeId, name: &str) -> Result<InodeId> {
        let entries = self.readdir(io, parent)?;
        find_entry(&entries, name).ok_or(DfsError::NotExist)
    }

    /// Create `name` of type `ty` under `parent`.
    pub fn mk_helper(
        &self,
        io: &mut dyn BlockIo,
        parent: InodeId,
        name: &str,
        ty: InodeType,
    ) -> Result<InodeId> {
        dfs_dir::validate_name(name)?;
        let (mut dir, text) = self.read_dir(io, parent)?;
        if find_entry(&parse_directory(text.as_bytes())?, name).is_some() {
            return Err(DfsError::AlreadyExist);
        }
        let id = self.alloc_inode(io, ty)?;
        let updated = append_to_directory(&text, name, id)?;
        self.write_content(io, &mut dir, updated.as_bytes())?;
        self.write_inode(io, parent, &dir)?;
        debug!(parent = parent.0, name, inode = id.0, "namespace: created");
        Ok(id)
    }

    /// Remove `name` from `parent` and free its inode. Non-empty directories
    /// are refused.
    pub fn unlink(&self, io: &mut dyn BlockIo, parent: InodeId, name: &str) -> Result<InodeId> {
        let (mut dir, text) = self.read_dir(io, parent)?;
        let victim =
            find_entry(&parse_directory(text.as_bytes())?, name).ok_or(DfsError::NotExist)?;
        let inode = self.read_inode(io, victim)?;
        if inode.ty == InodeType::Directory && inode.content_len > 0 {
            return Err(DfsError::InvalidArg(format!(
                "directory {name:?} is not empty"
            )));
        }
        self.free_inode(io, victim)?;
        let updated = rm_from_directory(&text, name)?;
        self.write_content(io, &mut dir, updated.as_bytes())?;
        self.write_inode(io, parent, &dir)?;
        debug!(parent = parent.0, name, inode = victim.0, "namespace: unlinked");
        Ok(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_block::{BlockDevice, ByteBlockDevice, DirectIo, MemByteDevice, WriteSet};

    fn formatted() -> (ByteBlockDevice<MemByteDevice>, Namespace) {
        let dev = ByteBlockDevice::memory(512, 256).expect("device");
        let ns = Namespace::format(&mut DirectIo::new(&dev), 256, 64).expect("format");
        (dev, ns)
    }

    #[test]
    fn format_creates_empty_root() {
        let (dev, ns) = formatted();
        let io = DirectIo::new(&dev);
        let (ty, attr) = ns.get_type_attr(&io, InodeId::ROOT).expect("attr");
        assert_eq!(ty, InodeType::Directory);
        assert_eq!(attr.size, 0);
        assert!(ns.readdir(&io, InodeId::ROOT).expect("readdir").is_empty());
        assert!(Namespace::is_formatted(&io).expect("format check"));
    }

    #[test]
    fn open_reads_back_geometry() {
        let (dev, ns) = formatted();
        let io = DirectIo::new(&dev);
        assert_eq!(Namespace::open(&io).expect("open"), ns);

        let blank = ByteBlockDevice::memory(512, 256).expect("device");
        let io = DirectIo::new(&blank);
        assert!(!Namespace::is_formatted(&io).expect("format check"));
        assert!(matches!(Namespace::open(&io), Err(DfsError::Format(_))));
    }

    #[test]
    fn create_lookup_and_list() {
        let (dev, ns) = formatted();
        let mut io = DirectIo::new(&dev);
        let a = ns
            .mk_helper(&mut io, InodeId::ROOT, "a", InodeType::File)
            .expect("mk a");
        let d = ns
            .mk_helper(&mut io, InodeId::ROOT, "d", InodeType::Directory)
            .expect("mk d");
        let nested = ns
            .mk_helper(&mut io, d, "inner", InodeType::File)
            .expect("mk inner");

        assert_eq!(ns.lookup(&io, InodeId::ROOT, "a").expect("lookup"), a);
        assert_eq!(ns.lookup(&io, d, "inner").expect("lookup"), nested);
        assert!(matches!(
            ns.lookup(&io, InodeId::ROOT, "missing"),
            Err(DfsError::NotExist)
        ));
        assert!(matches!(
            ns.mk_helper(&mut io, InodeId::ROOT, "a", InodeType::File),
            Err(DfsError::AlreadyExist)
        ));
        assert!(ns.lookup(&io, a, "x").is_err(), "files are not directories");

        let names: Vec<String> = ns
            .readdir(&io, InodeId::ROOT)
            .expect("readdir")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn content_grows_and_shrinks_across_blocks() {
        let (dev, ns) = formatted();
        let mut io = DirectIo::new(&dev);
        let baseline = ns.free_block_count(&io).expect("count");
        let f = ns
            .mk_helper(&mut io, InodeId::ROOT, "f", InodeType::File)
            .expect("mk");
        let after_mk = ns.free_block_count(&io).expect("count");

        let big: Vec<u8> = (0..1300_u32).map(|i| (i % 251) as u8).collect();
        ns.write_file(&mut io, f, &big).expect("write");
        assert_eq!(ns.read_file(&io, f).expect("read"), big);
        assert_eq!(ns.free_block_count(&io).expect("count"), after_mk - 3);

        ns.write_file(&mut io, f, b"tiny").expect("shrink");
        assert_eq!(ns.read_file(&io, f).expect("read"), b"tiny");
        assert_eq!(ns.free_block_count(&io).expect("count"), after_mk - 1);

        ns.unlink(&mut io, InodeId::ROOT, "f").expect("unlink");
        assert_eq!(ns.free_block_count(&io).expect("count"), baseline);
        assert!(matches!(ns.read_inode(&io, f), Err(DfsError::NotExist)));
    }

    #[test]
    fn unlink_refuses_non_empty_directory() {
        let (dev, ns) = formatted();
        let mut io = DirectIo::new(&dev);
        let d = ns
            .mk_helper(&mut io, InodeId::ROOT, "d", InodeType::Directory)
            .expect("mk");
        ns.mk_helper(&mut io, d, "x", InodeType::File).expect("mk");
        assert!(matches!(
            ns.unlink(&mut io, InodeId::ROOT, "d"),
            Err(DfsError::InvalidArg(_))
        ));
        ns.unlink(&mut io, d, "x").expect("unlink x");
        ns.unlink(&mut io, InodeId::ROOT, "d").expect("unlink d");
        assert!(matches!(
            ns.unlink(&mut io, InodeId::ROOT, "d"),
            Err(DfsError::NotExist)
        ));
    }

    #[test]
    fn staged_create_is_invisible_until_applied() {
        let (dev, ns) = formatted();
        let mut set = WriteSet::new(&dev);
        let id = ns
            .mk_helper(&mut set, InodeId::ROOT, "staged", InodeType::File)
            .expect("mk");
        assert_eq!(ns.lookup(&set, InodeId::ROOT, "staged").expect("lookup"), id);

        let io = DirectIo::new(&dev);
        assert!(matches!(
            ns.lookup(&io, InodeId::ROOT, "staged"),
            Err(DfsError::NotExist)
        ));
        assert!(matches!(ns.read_inode(&io, id), Err(DfsError::NotExist)));

        for op in set.into_ops() {
            dev.write_block(op.block, &op.bytes).expect("apply");
        }
        assert_eq!(ns.lookup(&io, InodeId::ROOT, "staged").expect("lookup"), id);
    }

    #[test]
    fn inode_table_exhaustion() {
        let dev = ByteBlockDevice::memory(512, 256).expect("device");
        let mut io = DirectIo::new(&dev);
        let ns = Namespace::format(&mut io, 256, 3).expect("format");
        ns.mk_helper(&mut io, InodeId::ROOT, "a", InodeType::File).expect("a");
        ns.mk_helper(&mut io, InodeId::ROOT, "b", InodeType::File).expect("b");
        assert!(matches!(
            ns.mk_helper(&mut io, InodeId::ROOT, "c", InodeType::File),
            Err(DfsError::OutOfResource)
        ));
        assert!(matches!(
            ns.get_type_attr(&io, InodeId(4)),
            Err(DfsError::InvalidArg(_))
        ));
    }

    #[test]
    fn set_size_is_reported_for_files() {
        let (dev, ns) = formatted();
        let mut io = DirectIo::new(&dev);
        let f = ns
            .mk_helper(&mut io, InodeId::ROOT, "f", InodeType::File)
            .expect("mk");
        ns.set_size(&mut io, f, 5000).expect("size");
        let (ty, attr) = ns.get_type_attr(&io, f).expect("attr");
        assert_eq!(ty, InodeType::File);
        assert_eq!(attr.size, 5000);
    }
}
