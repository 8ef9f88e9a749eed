#![forbid(unsafe_code)]
//! Client stub.
//!
//! Namespace calls and block maps go to the metadata service; file bytes go
//! straight to the data node named by each [`BlockInfo`]. The services may
//! be local nodes or RPC stubs.

use dfs_dir::DirEntry;
use dfs_error::{DfsError, Result};
use dfs_inode::Inode;
use dfs_rpc::{DataService, MetadataService};
use dfs_types::{BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct Client {
    block_size: u32,
    metadata: Option<Arc<dyn MetadataService>>,
    data: BTreeMap<MacId, Arc<dyn DataService>>,
    last_mac: u16,
}

impl Client {
    /// `block_size` must match the data nodes'.
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            metadata: None,
            data: BTreeMap::new(),
            last_mac: 0,
        }
    }

    pub fn register_metadata_server(&mut self, service: Arc<dyn MetadataService>) {
        self.metadata = Some(service);
    }

    /// Register a data node under the next machine id (starting at 1).
    ///
    /// Ids must line up with the metadata node's, so register data nodes in
    /// the same order on both.
    pub fn register_data_server(&mut self, service: Arc<dyn DataService>) -> Result<MacId> {
        let next = self
            .last_mac
            .checked_add(1)
            .ok_or(DfsError::OutOfResource)?;
        self.last_mac = next;
        self.data.insert(MacId(next), service);
        Ok(MacId(next))
    }

    fn meta(&self) -> Result<&Arc<dyn MetadataService>> {
        self.metadata
            .as_ref()
            .ok_or_else(|| DfsError::InvalidArg("no metadata server registered".to_owned()))
    }

    fn data_server(&self, mac_id: MacId) -> Result<&Arc<dyn DataService>> {
        self.data
            .get(&mac_id)
            .ok_or_else(|| DfsError::InvalidArg(format!("unknown data server {mac_id}")))
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn mknode(&self, ty: InodeType, parent: InodeId, name: &str) -> Result<InodeId> {
        self.meta()?.mknode(ty, parent, name)
    }

    pub fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        self.meta()?.unlink(parent, name).map(|_| ())
    }

    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.meta()?.lookup(parent, name)
    }

    pub fn readdir(&self, inode: InodeId) -> Result<Vec<DirEntry>> {
        self.meta()?.readdir(inode)
    }

    pub fn get_type_attr(&self, inode: InodeId) -> Result<(InodeType, FileAttr)> {
        self.meta()?.get_type_attr(inode)
    }

    pub fn free_file_block(&self, inode: InodeId, block_id: BlockId, mac_id: MacId) -> Result<bool> {
        self.meta()?.free_block(inode, block_id, mac_id)
    }

    // ── File content ────────────────────────────────────────────────────

    /// End of `[offset, offset + len)`, or `InvalidArg` past `u64::MAX`.
    fn range_end(offset: u64, len: u64) -> Result<u64> {
        offset.checked_add(len).ok_or_else(|| {
            DfsError::InvalidArg(format!("range of {len} bytes at offset {offset} overflows"))
        })
    }

    /// Split `[offset, offset + len)` into per-block `(index, offset, len)`.
    fn chunks(&self, offset: u64, len: u64) -> Result<impl Iterator<Item = (usize, u32, u32)>> {
        let bs = u64::from(self.block_size);
        let end = Self::range_end(offset, len)?;
        let mut pos = offset;
        Ok(std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let in_block = pos % bs;
            let take = (bs - in_block).min(end - pos);
            #[expect(clippy::cast_possible_truncation)] // all bounded by the u32 block size
            let chunk = ((pos / bs) as usize, in_block as u32, take as u32);
            pos += take;
            Some(chunk)
        }))
    }

    /// Read up to `len` bytes at `offset`, clamped to the file size.
    ///
    /// An empty reply means the block map is stale; the map is fetched again
    /// once and the block retried.
    pub fn read_file(&self, inode: InodeId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let meta = self.meta()?;
        let size = meta.get_type_attr(inode)?.1.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        let mut map = meta.get_block_map(inode)?;
        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        for (idx, in_block, take) in self.chunks(offset, len)? {
            let mut refreshed = false;
            loop {
                let info = *map.get(idx).ok_or_else(|| {
                    DfsError::InvalidArg(format!(
                        "block map of inode {inode} has {} entries, need block {idx}",
                        map.len()
                    ))
                })?;
                let bytes = self.data_server(info.mac_id)?.read_data(
                    info.block_id,
                    in_block,
                    take,
                    info.version,
                )?;
                if !bytes.is_empty() {
                    trace!(inode = inode.0, block = info.block_id.0, len = bytes.len(), "client: read");
                    out.extend_from_slice(&bytes);
                    break;
                }
                if refreshed {
                    return Err(DfsError::InvalidArg(format!(
                        "block {} of inode {inode} stays stale after refresh",
                        info.block_id
                    )));
                }
                debug!(inode = inode.0, block = info.block_id.0, "client: stale block map, refreshing");
                map = meta.get_block_map(inode)?;
                refreshed = true;
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`, allocating blocks as needed, then grow the
    /// recorded file size.
    ///
    /// Every missing block up to the end of the write is allocated before
    /// any byte is sent. If an allocation fails, the blocks claimed by this
    /// call are freed again (best effort) and the file is left as it was.
    pub fn write_file(&self, inode: InodeId, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let end = Self::range_end(offset, len)?;
        let bs = u64::from(self.block_size);
        let limit = Inode::max_map_entries(self.block_size as usize) as u64;
        let last = (end - 1) / bs;
        if last >= limit {
            return Err(DfsError::InvalidArg(format!(
                "write ending at byte {end} needs block {last}, files hold at most {limit} blocks"
            )));
        }

        let meta = self.meta()?;
        let mut map: Vec<BlockInfo> = meta.get_block_map(inode)?;
        let existing = map.len();
        while (map.len() as u64) <= last {
            match meta.alloc_block(inode) {
                Ok(info) => map.push(info),
                Err(err) => {
                    self.release(inode, &map[existing..]);
                    return Err(err);
                }
            }
        }

        let mut written = 0_usize;
        for (idx, in_block, take) in self.chunks(offset, len)? {
            let info = map[idx];
            let next = written + take as usize;
            self.data_server(info.mac_id)?
                .write_data(info.block_id, in_block, &data[written..next])?;
            written = next;
        }
        meta.extend_size(inode, end)?;
        debug!(inode = inode.0, offset, len = data.len(), "client: write");
        Ok(())
    }

    /// Free blocks this client just appended to `inode`, newest first.
    fn release(&self, inode: InodeId, fresh: &[BlockInfo]) {
        let Ok(meta) = self.meta() else {
            return;
        };
        for info in fresh.iter().rev() {
            if let Err(err) = meta.free_block(inode, info.block_id, info.mac_id) {
                warn!(
                    inode = inode.0,
                    block = info.block_id.0,
                    mac_id = info.mac_id.0,
                    error = %err,
                    "client: could not release block after failed allocation"
                );
            }
        }
    }
}
