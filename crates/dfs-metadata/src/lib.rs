#![forbid(unsafe_code)]
//! Metadata node.
//!
//! Owns the metadata device: a [`Namespace`] in the user region and, when
//! enabled, a [`ShadowLog`] right after it. Every structural mutation runs as
//! one transaction:
//!
//! 1. take the global structural lock,
//! 2. optionally checkpoint,
//! 3. assign a txn id and open a pending [`WriteSet`],
//! 4. run the namespace mutation against the write set,
//! 5. `append_log` the staged blocks, then `commit_log`.
//!
//! Nothing reaches a target block before the commit marker is durable, so
//! readers (which take no global lock) see either the whole transaction or
//! none of it. The apply step runs under the write side of a reader gate so
//! a read never interleaves with a half-applied commit.
//!
//! File content lives on data nodes. A file inode's content is its block
//! map: packed [`BlockInfo`] triples naming the data node and the version at
//! which the block was handed out. Remote allocations and frees are not part
//! of any transaction; see [`MetadataNode::unlink`] and
//! [`MetadataService::alloc_block`] for the best-effort edges.
//!
//! Lock order: per-inode stripe, then the global lock, then the gate.

mod options;

pub use options::MetadataOptions;

use dfs_block::{BlockDevice, BlockIo, ByteBlockDevice, DirectIo, LockTable, MemByteDevice};
use dfs_dir::DirEntry;
use dfs_error::{DfsError, Result};
use dfs_inode::Namespace;
use dfs_journal::{CheckpointReport, RecoveryReport, ShadowLog};
use dfs_rpc::{DataService, MetadataService};
use dfs_types::{
    BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId, decode_block_map, encode_block_map,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct TxnState {
    log: Option<ShadowLog>,
    /// A commit failed after its marker; finish it before the next txn.
    needs_checkpoint: bool,
}

/// A transaction that was not aborted.
enum Txn<T> {
    /// Targets written and visible to readers.
    Applied(T),
    /// Commit marker durable, targets not written. The next checkpoint (at
    /// the latest, the next transaction) makes it visible.
    Pending(T, DfsError),
}

impl<T> Txn<T> {
    /// Collapse to a result; a pending txn reports the error that stopped
    /// its apply.
    fn applied(self) -> Result<T> {
        match self {
            Self::Applied(value) => Ok(value),
            Self::Pending(_, err) => Err(err),
        }
    }
}

#[derive(Default)]
struct Registry {
    nodes: BTreeMap<MacId, Arc<dyn DataService>>,
    last: u16,
}

pub struct MetadataNode<D: BlockDevice> {
    dev: D,
    ns: Namespace,
    options: MetadataOptions,
    txn: Mutex<TxnState>,
    gate: RwLock<()>,
    inode_locks: LockTable,
    machine_locks: LockTable,
    registry: RwLock<Registry>,
}

impl MetadataNode<ByteBlockDevice<MemByteDevice>> {
    /// Fresh node on a zeroed in-memory device.
    pub fn in_memory(options: MetadataOptions) -> Result<Self> {
        options.validate()?;
        let dev = ByteBlockDevice::memory(options.block_size, options.device_blocks())?;
        Self::open(dev, options)
    }
}

impl<D: BlockDevice> MetadataNode<D> {
    /// Open the node on `dev`, formatting it if it carries no namespace.
    ///
    /// An existing log is recovered first when `recover_on_open` is set.
    pub fn open(dev: D, options: MetadataOptions) -> Result<Self> {
        options.validate()?;
        if dev.block_size() != options.block_size {
            return Err(DfsError::Format(format!(
                "device block size {} does not match configured {}",
                dev.block_size(),
                options.block_size
            )));
        }
        if dev.block_count() < options.device_blocks() {
            return Err(DfsError::Format(format!(
                "device has {} blocks, {} required",
                dev.block_count(),
                options.device_blocks()
            )));
        }

        let formatted = Namespace::is_formatted(&DirectIo::new(&dev))?;
        let log_start = BlockId(options.user_blocks);
        let (ns, log) = if formatted {
            let log = if options.log_enabled {
                let mut log = ShadowLog::open(&dev, log_start, options.log_blocks, false)?;
                if options.recover_on_open {
                    log.recover(&dev)?;
                }
                Some(log)
            } else {
                None
            };
            (Namespace::open(&DirectIo::new(&dev))?, log)
        } else {
            let log = if options.log_enabled {
                Some(ShadowLog::open(&dev, log_start, options.log_blocks, true)?)
            } else {
                None
            };
            let ns = Namespace::format(
                &mut DirectIo::new(&dev),
                options.user_blocks,
                options.max_inodes,
            )?;
            (ns, log)
        };
        if ns.user_blocks() != options.user_blocks {
            return Err(DfsError::Format(format!(
                "image has {} user blocks, configured {}",
                ns.user_blocks(),
                options.user_blocks
            )));
        }
        info!(
            user_blocks = options.user_blocks,
            log_enabled = options.log_enabled,
            created = !formatted,
            "metadata: opened"
        );
        Ok(Self {
            inode_locks: LockTable::new(options.lock_stripes),
            machine_locks: LockTable::new(options.lock_stripes),
            dev,
            ns,
            options,
            txn: Mutex::new(TxnState {
                log,
                needs_checkpoint: false,
            }),
            gate: RwLock::new(()),
            registry: RwLock::new(Registry::default()),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn options(&self) -> &MetadataOptions {
        &self.options
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Free blocks in the user region.
    pub fn free_block_count(&self) -> Result<u64> {
        let _gate = self.gate.read();
        self.ns.free_block_count(&DirectIo::new(&self.dev))
    }

    // ── Data node registry ──────────────────────────────────────────────

    /// Register a data node under the next machine id (starting at 1).
    pub fn reg_server(&self, node: Arc<dyn DataService>) -> Result<MacId> {
        let mut registry = self.registry.write();
        let next = registry
            .last
            .checked_add(1)
            .ok_or(DfsError::OutOfResource)?;
        registry.last = next;
        registry.nodes.insert(MacId(next), node);
        info!(mac_id = next, "metadata: data node registered");
        Ok(MacId(next))
    }

    fn data_node(&self, mac_id: MacId) -> Result<Arc<dyn DataService>> {
        self.registry
            .read()
            .nodes
            .get(&mac_id)
            .cloned()
            .ok_or_else(|| DfsError::InvalidArg(format!("unknown data node {mac_id}")))
    }

    fn remote_free(&self, info: &BlockInfo) -> Result<bool> {
        let node = self.data_node(info.mac_id)?;
        let _machine = self.machine_locks.lock(u64::from(info.mac_id.0));
        node.free_block(info.block_id)
    }

    // ── Log maintenance ─────────────────────────────────────────────────

    /// Redo committed work and discard uncommitted work.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut state = self.txn.lock();
        let TxnState {
            log,
            needs_checkpoint,
        } = &mut *state;
        let Some(log) = log.as_mut() else {
            return Ok(RecoveryReport::default());
        };
        let _gate = self.gate.write();
        let report = log.recover(&self.dev)?;
        *needs_checkpoint = false;
        Ok(report)
    }

    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let mut state = self.txn.lock();
        let TxnState {
            log,
            needs_checkpoint,
        } = &mut *state;
        let Some(log) = log.as_mut() else {
            return Ok(CheckpointReport::default());
        };
        let _gate = self.gate.write();
        let report = log.checkpoint(&self.dev)?;
        *needs_checkpoint = false;
        Ok(report)
    }

    /// Entries currently held in the log (0 without a log).
    #[must_use]
    pub fn log_entry_count(&self) -> usize {
        self.txn
            .lock()
            .log
            .as_ref()
            .map_or(0, ShadowLog::entry_count)
    }

    /// Make room for `ops` operations. Under the global lock no txn is in
    /// flight, so entries that survive a checkpoint belong to aborted txns.
    fn ensure_room(&self, log: &mut ShadowLog, ops: usize) -> Result<()> {
        if log.has_room(&self.dev, ops)? {
            return Ok(());
        }
        log.checkpoint(&self.dev)?;
        if log.has_room(&self.dev, ops)? {
            return Ok(());
        }
        warn!(
            entries = log.entry_count(),
            "metadata: log full of aborted txns, discarding them"
        );
        log.recover(&self.dev)?;
        if log.has_room(&self.dev, ops)? {
            Ok(())
        } else {
            Err(DfsError::OutOfResource)
        }
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Run `mutate` as one logged transaction.
    ///
    /// `Err` means the txn was aborted before its commit marker and left no
    /// trace. A failure after the marker is retried once by checkpointing
    /// and, if that fails too, surfaces as [`Txn::Pending`].
    fn run_txn<T>(
        &self,
        op: &'static str,
        mutate: impl FnOnce(&Namespace, &mut dyn BlockIo) -> Result<T>,
    ) -> Result<Txn<T>> {
        let mut state = self.txn.lock();
        let TxnState {
            log,
            needs_checkpoint,
        } = &mut *state;
        let Some(log) = log.as_mut() else {
            let _gate = self.gate.write();
            return mutate(&self.ns, &mut DirectIo::new(&self.dev)).map(Txn::Applied);
        };

        if self.options.checkpoint_enabled || *needs_checkpoint {
            let _gate = self.gate.write();
            log.checkpoint(&self.dev)?;
            *needs_checkpoint = false;
        }
        let txn = log.begin_txn();
        let mut set = log.prepare(&self.dev);
        let value = mutate(&self.ns, &mut set)?;
        let ops = set.into_ops();
        if ops.is_empty() {
            return Ok(Txn::Applied(value));
        }

        let _gate = self.gate.write();
        self.ensure_room(log, ops.len())?;
        log.append_log(&self.dev, txn, &ops)?;
        match log.commit_log(&self.dev, txn) {
            Ok(()) => {
                debug!(txn = txn.0, op, blocks = ops.len(), "metadata: committed");
                Ok(Txn::Applied(value))
            }
            Err(err) if !log.is_committed(txn) => {
                warn!(txn = txn.0, op, error = %err, "metadata: commit aborted before marker");
                Err(err)
            }
            Err(err) => match log.checkpoint(&self.dev) {
                Ok(_) => {
                    warn!(txn = txn.0, op, error = %err, "metadata: commit finished by checkpoint");
                    Ok(Txn::Applied(value))
                }
                Err(retry) => {
                    *needs_checkpoint = true;
                    warn!(
                        txn = txn.0,
                        op,
                        error = %err,
                        retry_error = %retry,
                        "metadata: committed txn left unapplied"
                    );
                    Ok(Txn::Pending(value, err))
                }
            },
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Namespace, &dyn BlockIo) -> Result<T>) -> Result<T> {
        let _gate = self.gate.read();
        f(&self.ns, &DirectIo::new(&self.dev))
    }

    fn file_map(ns: &Namespace, io: &dyn BlockIo, inode: InodeId) -> Result<Vec<BlockInfo>> {
        let node = ns.read_inode(io, inode)?;
        if node.ty != InodeType::File {
            return Err(DfsError::InvalidArg(format!("inode {inode} is not a file")));
        }
        let bytes = ns.read_file(io, inode)?;
        decode_block_map(&bytes).map_err(|err| DfsError::Corruption {
            block: node.blocks.first().map_or(0, |block| block.0),
            detail: format!("block map of inode {inode}: {err}"),
        })
    }

    /// Remove `name` from `parent`.
    ///
    /// The victim's data blocks are freed on their data nodes first; a
    /// failed remote free is logged and does not stop the removal, and
    /// nothing is rolled back if the removal itself fails.
    pub fn unlink(&self, parent: InodeId, name: &str) -> Result<bool> {
        let victim = self.read(|ns, io| ns.lookup(io, parent, name))?;
        let _inode = self.inode_locks.lock(victim.0);

        let map = self.read(|ns, io| match ns.read_inode(io, victim)?.ty {
            InodeType::File => Self::file_map(ns, io, victim),
            _ => Ok(Vec::new()),
        })?;
        for info in &map {
            if let Err(err) = self.remote_free(info) {
                warn!(
                    inode = victim.0,
                    block = info.block_id.0,
                    mac_id = info.mac_id.0,
                    error = %err,
                    "metadata: remote free failed during unlink"
                );
            }
        }

        self.run_txn("unlink", |ns, io| {
            if ns.lookup(io, parent, name)? != victim {
                return Err(DfsError::InvalidArg(format!(
                    "{name:?} changed during unlink"
                )));
            }
            ns.unlink(io, parent, name)
        })?
        .applied()?;
        debug!(parent = parent.0, name, inode = victim.0, blocks = map.len(), "metadata: unlink");
        Ok(true)
    }
}

impl<D: BlockDevice> MetadataService for MetadataNode<D> {
    fn mknode(&self, ty: InodeType, parent: InodeId, name: &str) -> Result<InodeId> {
        if ty == InodeType::Unknown {
            return Err(DfsError::InvalidArg("cannot create an inode of unknown type".to_owned()));
        }
        let id = self
            .run_txn("mknode", |ns, io| ns.mk_helper(io, parent, name, ty))?
            .applied()?;
        debug!(parent = parent.0, name, inode = id.0, ?ty, "metadata: mknode");
        Ok(id)
    }

    fn unlink(&self, parent: InodeId, name: &str) -> Result<bool> {
        MetadataNode::unlink(self, parent, name)
    }

    fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.read(|ns, io| ns.lookup(io, parent, name))
    }

    fn readdir(&self, inode: InodeId) -> Result<Vec<DirEntry>> {
        self.read(|ns, io| ns.readdir(io, inode))
    }

    fn get_type_attr(&self, inode: InodeId) -> Result<(InodeType, FileAttr)> {
        self.read(|ns, io| ns.get_type_attr(io, inode))
    }

    fn get_block_map(&self, inode: InodeId) -> Result<Vec<BlockInfo>> {
        let _inode = self.inode_locks.lock(inode.0);
        self.read(|ns, io| Self::file_map(ns, io, inode))
    }

    /// Claim a block on the first data node that has one and append it to
    /// the file's block map.
    ///
    /// The map update is a logged transaction; the remote allocation is not.
    /// If the transaction aborts the remote block is freed again, best
    /// effort. Once the append is committed the block stays claimed even if
    /// an error is returned, because the map will name it. A crash between
    /// the remote allocation and the commit leaks that one remote block.
    fn alloc_block(&self, inode: InodeId) -> Result<BlockInfo> {
        let _inode = self.inode_locks.lock(inode.0);
        self.read(|ns, io| Self::file_map(ns, io, inode).map(|_| ()))?;

        let nodes: Vec<(MacId, Arc<dyn DataService>)> = self
            .registry
            .read()
            .nodes
            .iter()
            .map(|(mac, node)| (*mac, Arc::clone(node)))
            .collect();
        let mut claimed = None;
        for (mac_id, node) in nodes {
            let _machine = self.machine_locks.lock(u64::from(mac_id.0));
            match node.alloc_block() {
                Ok((block_id, version)) => {
                    claimed = Some(BlockInfo {
                        block_id,
                        mac_id,
                        version,
                    });
                    break;
                }
                Err(err) => debug!(mac_id = mac_id.0, error = %err, "metadata: data node declined"),
            }
        }
        let info = claimed.ok_or(DfsError::OutOfResource)?;

        let appended = self.run_txn("alloc_block", |ns, io| {
            let mut map = Self::file_map(ns, io, inode)?;
            map.push(info);
            ns.write_file(io, inode, &encode_block_map(&map))
        });
        match appended {
            Ok(Txn::Applied(())) => {}
            Ok(Txn::Pending((), err)) => return Err(err),
            Err(err) => {
                if let Err(undo) = self.remote_free(&info) {
                    warn!(
                        block = info.block_id.0,
                        mac_id = info.mac_id.0,
                        error = %undo,
                        "metadata: compensating free failed, remote block leaked"
                    );
                }
                return Err(err);
            }
        }
        debug!(
            inode = inode.0,
            block = info.block_id.0,
            mac_id = info.mac_id.0,
            version = info.version.0,
            "metadata: alloc_block"
        );
        Ok(info)
    }

    /// Drop one entry from the block map, then free it on its data node.
    ///
    /// Returns `false` when the map entry was removed but the remote free
    /// failed; the data node accepts a retried free of the same block. The
    /// remote free is sent whenever the removal is committed, including when
    /// its apply is still pending and an error is returned.
    fn free_block(&self, inode: InodeId, block_id: BlockId, mac_id: MacId) -> Result<bool> {
        let removed = {
            let _inode = self.inode_locks.lock(inode.0);
            self.run_txn("free_block", |ns, io| {
                let mut map = Self::file_map(ns, io, inode)?;
                let pos = map
                    .iter()
                    .position(|info| info.block_id == block_id && info.mac_id == mac_id)
                    .ok_or(DfsError::NotExist)?;
                let removed = map.remove(pos);
                ns.write_file(io, inode, &encode_block_map(&map))?;
                Ok(removed)
            })?
        };
        let (info, pending) = match removed {
            Txn::Applied(info) => (info, None),
            Txn::Pending(info, err) => (info, Some(err)),
        };
        let freed = match self.remote_free(&info) {
            Ok(freed) => freed,
            Err(err) => {
                warn!(
                    inode = inode.0,
                    block = block_id.0,
                    mac_id = mac_id.0,
                    error = %err,
                    "metadata: remote free failed"
                );
                false
            }
        };
        match pending {
            Some(err) => Err(err),
            None => Ok(freed),
        }
    }

    fn extend_size(&self, inode: InodeId, end: u64) -> Result<u64> {
        let _inode = self.inode_locks.lock(inode.0);
        self.run_txn("extend_size", |ns, io| {
            let node = ns.read_inode(io, inode)?;
            if node.ty != InodeType::File {
                return Err(DfsError::InvalidArg(format!("inode {inode} is not a file")));
            }
            if end > node.size {
                ns.set_size(io, inode, end)?;
                Ok(end)
            } else {
                Ok(node.size)
            }
        })?
        .applied()
    }
}
