#![forbid(unsafe_code)]
//! Shadow-block redo log.
//!
//! A private region of a block device records every staged block mutation
//! of a transaction before it touches its real location. Each staged block
//! is copied into a shadow block owned by the log, and an entry
//! `{txn, target, shadow}` is appended to a packed entry array.
//!
//! # Commit protocol
//!
//! 1. [`ShadowLog::append_log`]: per operation, allocate a shadow block,
//!    append its entry (synced), then write the shadow content (synced).
//!    The entry carries a CRC32c of the content, so a shadow block is never
//!    trusted unless it verifies.
//! 2. [`ShadowLog::commit_log`]: verify every shadow of the txn, append the
//!    commit marker (synced), then copy shadows onto their targets (synced).
//!    The durable marker is the commit point.
//! 3. [`ShadowLog::checkpoint`]: finish any committed txn not yet applied,
//!    drop committed entries and free their shadows. Entries of txns without
//!    a marker are kept, shadows included.
//! 4. [`ShadowLog::recover`]: checkpoint, then discard whatever is left.
//!    Only work that reached a commit marker is ever redone.
//!
//! # Invariants
//!
//! - Redo is idempotent: replaying a committed txn twice yields the same
//!   target contents as replaying it once.
//! - A txn without a marker never reaches its targets through recovery.
//! - The in-memory entry list mirrors the durable array; it only grows after
//!   the corresponding slot write has been synced.

mod entry;

pub use entry::{LOG_ENTRY_SIZE, LogEntry, LogLayout};

use dfs_alloc::BitmapAllocator;
use dfs_block::{BlockDevice, BlockOperation, DirectIo, WriteSet};
use dfs_error::{DfsError, Result};
use dfs_types::{BlockId, TxnId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, trace, warn};

/// Outcome of a [`ShadowLog::checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Committed txns whose entries were reclaimed.
    pub txns_reclaimed: usize,
    /// Committed txns that had to be (re)applied first.
    pub txns_redone: usize,
    pub entries_reclaimed: usize,
    /// Entries of uncommitted txns left in place.
    pub entries_retained: usize,
}

/// Outcome of a [`ShadowLog::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub txns_redone: usize,
    pub blocks_redone: usize,
    /// Txns dropped because they never reached a commit marker.
    pub txns_discarded: usize,
    pub entries_discarded: usize,
}

/// Redo log over a region `[log_start, log_start + log_blocks)` of a device.
///
/// The log does not own the device; every call borrows it.
#[derive(Debug)]
pub struct ShadowLog {
    layout: LogLayout,
    shadows: BitmapAllocator,
    cur_txn: TxnId,
    entries: Vec<LogEntry>,
    /// Committed txns whose targets are known to be written in this process.
    applied: HashSet<TxnId>,
}

impl ShadowLog {
    /// Attach to (or with `create`, initialize) the log region.
    pub fn open(
        dev: &dyn BlockDevice,
        log_start: BlockId,
        log_blocks: u64,
        create: bool,
    ) -> Result<Self> {
        let layout = LogLayout::new(dev.block_size(), log_start.0, log_blocks)?;
        if layout.log_end() > dev.block_count() {
            return Err(DfsError::Format(format!(
                "log region {}..{} exceeds device block count {}",
                layout.log_start,
                layout.log_end(),
                dev.block_count()
            )));
        }
        let mut io = DirectIo::new(dev);
        let shadows = BitmapAllocator::open(
            &mut io,
            BlockId(layout.bitmap_start),
            layout.data_start..layout.log_end(),
            create,
        )?;

        let entries = if create {
            for idx in 0..layout.meta_blocks {
                dev.zero_block(BlockId(layout.log_start + idx))?;
            }
            dev.sync()?;
            Vec::new()
        } else {
            Self::scan_entries(dev, &layout)?
        };

        let cur_txn = entries
            .iter()
            .map(|entry| entry.txn)
            .max()
            .unwrap_or(TxnId(0));
        info!(
            log_start = layout.log_start,
            log_blocks,
            meta_blocks = layout.meta_blocks,
            shadow_blocks = layout.data_blocks,
            entries = entries.len(),
            create,
            "shadow_log: opened"
        );
        Ok(Self {
            layout,
            shadows,
            cur_txn,
            entries,
            applied: HashSet::new(),
        })
    }

    fn scan_entries(dev: &dyn BlockDevice, layout: &LogLayout) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        'blocks: for idx in 0..layout.meta_blocks {
            let block = BlockId(layout.log_start + idx);
            let buf = dev.read_block(block)?;
            for slot in buf.as_slice().chunks_exact(LOG_ENTRY_SIZE) {
                let Some(entry) = LogEntry::decode(slot, block)? else {
                    break 'blocks;
                };
                if !entry.is_commit_marker()
                    && (!layout.is_shadow(entry.shadow) || layout.contains(entry.target))
                {
                    return Err(DfsError::corruption(
                        block.0,
                        format!(
                            "log entry txn={} target={} shadow={} outside its regions",
                            entry.txn, entry.target, entry.shadow
                        ),
                    ));
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    #[must_use]
    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// Entries currently in the log, in append order.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Authoritative count of entries in the array.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Last txn id handed out (or found in the log at open).
    #[must_use]
    pub fn current_txn(&self) -> TxnId {
        self.cur_txn
    }

    /// Assign the next transaction id.
    pub fn begin_txn(&mut self) -> TxnId {
        self.cur_txn = self.cur_txn.next();
        debug!(txn = self.cur_txn.0, "shadow_log: begin");
        self.cur_txn
    }

    /// Open a fresh, empty pending write set over `dev`.
    #[must_use]
    pub fn prepare<'a>(&self, dev: &'a dyn BlockDevice) -> WriteSet<'a> {
        WriteSet::new(dev)
    }

    pub fn free_shadow_blocks(&self, dev: &dyn BlockDevice) -> Result<u64> {
        self.shadows.free_block_count(&DirectIo::new(dev))
    }

    /// Whether a txn of `ops` operations (plus its marker) fits right now.
    pub fn has_room(&self, dev: &dyn BlockDevice, ops: usize) -> Result<bool> {
        let slots_free = self.layout.capacity().saturating_sub(self.entries.len());
        if slots_free < ops + 1 {
            return Ok(false);
        }
        Ok(self.free_shadow_blocks(dev)? >= ops as u64)
    }

    /// Record `ops` for `txn`: shadow copy plus durable entry per operation.
    pub fn append_log(
        &mut self,
        dev: &dyn BlockDevice,
        txn: TxnId,
        ops: &[BlockOperation],
    ) -> Result<()> {
        if txn.0 == 0 {
            return Err(DfsError::InvalidArg("txn id 0 is reserved".to_owned()));
        }
        for op in ops {
            if op.block.0 == 0 || self.layout.contains(op.block) {
                return Err(DfsError::InvalidArg(format!(
                    "block {} cannot be a log target",
                    op.block
                )));
            }
            if op.bytes.len() != dev.block_size() as usize {
                return Err(DfsError::InvalidArg(format!(
                    "staged block {} has {} bytes, expected {}",
                    op.block,
                    op.bytes.len(),
                    dev.block_size()
                )));
            }
        }
        if self.layout.capacity() < self.entries.len() + ops.len() + 1 {
            return Err(DfsError::OutOfResource);
        }

        let mut io = DirectIo::new(dev);
        for op in ops {
            let shadow = self.shadows.allocate(&mut io)?;
            let entry = LogEntry {
                txn,
                target: op.block,
                shadow,
                checksum: crc32c::crc32c(&op.bytes),
            };
            self.write_slot(dev, self.entries.len(), &entry)?;
            self.entries.push(entry);
            dev.write_block(shadow, &op.bytes)?;
            dev.sync()?;
            trace!(
                txn = txn.0,
                target = op.block.0,
                shadow = shadow.0,
                "shadow_log: appended"
            );
        }
        debug!(txn = txn.0, ops = ops.len(), "shadow_log: append_log");
        Ok(())
    }

    /// Make `txn` durable and apply it in place.
    ///
    /// On `Ok`, the marker and every target write are synced. An error after
    /// the marker is durable leaves the txn committed but unapplied; the next
    /// checkpoint or recovery finishes it.
    pub fn commit_log(&mut self, dev: &dyn BlockDevice, txn: TxnId) -> Result<()> {
        let ops = self.txn_entries(txn);
        if ops.is_empty() {
            return Ok(());
        }
        if self.has_marker(txn) {
            return Err(DfsError::InvalidArg(format!("txn {txn} already committed")));
        }
        let staged = Self::load_shadows(dev, &ops)?;

        let marker = LogEntry::marker(txn);
        self.write_slot(dev, self.entries.len(), &marker)?;
        self.entries.push(marker);

        Self::apply(dev, &staged)?;
        self.applied.insert(txn);
        debug!(txn = txn.0, blocks = staged.len(), "shadow_log: committed");
        Ok(())
    }

    /// Reclaim committed txns; keep uncommitted entries and their shadows.
    pub fn checkpoint(&mut self, dev: &dyn BlockDevice) -> Result<CheckpointReport> {
        let committed: BTreeSet<TxnId> = self
            .entries
            .iter()
            .filter(|entry| entry.is_commit_marker())
            .map(|entry| entry.txn)
            .collect();
        if committed.is_empty() {
            return Ok(CheckpointReport {
                entries_retained: self.entries.len(),
                ..CheckpointReport::default()
            });
        }

        let mut report = CheckpointReport::default();
        for txn in &committed {
            if !self.applied.contains(txn) {
                let staged = Self::load_shadows(dev, &self.txn_entries(*txn))?;
                Self::apply(dev, &staged)?;
                self.applied.insert(*txn);
                report.txns_redone += 1;
            }
        }

        let (reclaimed, retained): (Vec<LogEntry>, Vec<LogEntry>) = self
            .entries
            .iter()
            .partition(|entry| committed.contains(&entry.txn));
        self.rewrite_entries(dev, &retained)?;

        let mut set = WriteSet::new(dev);
        for entry in reclaimed.iter().filter(|entry| !entry.is_commit_marker()) {
            self.shadows.deallocate(&mut set, entry.shadow)?;
        }
        for op in set.into_ops() {
            dev.write_block(op.block, &op.bytes)?;
        }
        dev.sync()?;

        self.entries = retained;
        self.applied.retain(|txn| !committed.contains(txn));
        report.txns_reclaimed = committed.len();
        report.entries_reclaimed = reclaimed.len();
        report.entries_retained = self.entries.len();
        info!(
            txns_reclaimed = report.txns_reclaimed,
            txns_redone = report.txns_redone,
            entries_reclaimed = report.entries_reclaimed,
            entries_retained = report.entries_retained,
            "shadow_log: checkpoint"
        );
        Ok(report)
    }

    /// Redo committed txns, discard uncommitted ones, empty the log.
    ///
    /// Safe to run any number of times.
    pub fn recover(&mut self, dev: &dyn BlockDevice) -> Result<RecoveryReport> {
        // After a restart nothing is known to be applied; redo every commit.
        self.applied.clear();
        let blocks_redone = self
            .entries
            .iter()
            .filter(|entry| !entry.is_commit_marker() && self.has_marker(entry.txn))
            .count();
        let checkpoint = self.checkpoint(dev)?;

        let mut discarded = BTreeMap::<TxnId, usize>::new();
        for entry in &self.entries {
            *discarded.entry(entry.txn).or_default() += 1;
        }
        if !discarded.is_empty() {
            warn!(
                txns = ?discarded.keys().map(|txn| txn.0).collect::<Vec<_>>(),
                "shadow_log: discarding uncommitted transactions"
            );
        }
        self.rewrite_entries(dev, &[])?;
        self.shadows.reset(&mut DirectIo::new(dev))?;
        self.entries.clear();

        let report = RecoveryReport {
            txns_redone: checkpoint.txns_redone,
            blocks_redone,
            txns_discarded: discarded.len(),
            entries_discarded: discarded.values().sum(),
        };
        info!(
            txns_redone = report.txns_redone,
            blocks_redone = report.blocks_redone,
            txns_discarded = report.txns_discarded,
            entries_discarded = report.entries_discarded,
            "shadow_log: recovered"
        );
        Ok(report)
    }

    /// Whether `txn` reached its commit marker and is still in the log.
    ///
    /// After a failed [`commit_log`](Self::commit_log) this separates an
    /// aborted txn (`false`) from one that is durable but not yet applied.
    #[must_use]
    pub fn is_committed(&self, txn: TxnId) -> bool {
        self.has_marker(txn)
    }

    fn has_marker(&self, txn: TxnId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.txn == txn && entry.is_commit_marker())
    }

    fn txn_entries(&self, txn: TxnId) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.txn == txn && !entry.is_commit_marker())
            .copied()
            .collect()
    }

    /// Read and verify shadow content for `entries`.
    fn load_shadows(
        dev: &dyn BlockDevice,
        entries: &[LogEntry],
    ) -> Result<Vec<(BlockId, Vec<u8>)>> {
        entries
            .iter()
            .map(|entry| {
                let bytes = dev.read_block(entry.shadow)?.into_inner();
                let actual = crc32c::crc32c(&bytes);
                if actual != entry.checksum {
                    return Err(DfsError::corruption(
                        entry.shadow.0,
                        format!(
                            "shadow checksum mismatch for txn {} target {}: expected {:#010x}, got {actual:#010x}",
                            entry.txn, entry.target, entry.checksum
                        ),
                    ));
                }
                Ok((entry.target, bytes))
            })
            .collect()
    }

    fn apply(dev: &dyn BlockDevice, staged: &[(BlockId, Vec<u8>)]) -> Result<()> {
        for (target, bytes) in staged {
            dev.write_block(*target, bytes)?;
        }
        dev.sync()
    }

    fn write_slot(&self, dev: &dyn BlockDevice, slot: usize, entry: &LogEntry) -> Result<()> {
        let (block, offset) = self.layout.slot_position(slot);
        dev.write_partial_block(block, offset, &entry.encode())?;
        dev.sync()
    }

    /// Replace the durable array with `entries`, zeroing stale slots.
    fn rewrite_entries(&self, dev: &dyn BlockDevice, entries: &[LogEntry]) -> Result<()> {
        let used = self.entries.len().max(entries.len());
        let per_block = usize::try_from(self.layout.entries_per_block)
            .map_err(|_| DfsError::Format("entries per block overflows usize".to_owned()))?;
        let blocks = used.div_ceil(per_block);
        for (idx, chunk) in (0..blocks).map(|idx| {
            let start = (idx * per_block).min(entries.len());
            let end = ((idx + 1) * per_block).min(entries.len());
            (idx, &entries[start..end])
        }) {
            let mut buf = vec![0_u8; dev.block_size() as usize];
            for (pos, entry) in chunk.iter().enumerate() {
                buf[pos * LOG_ENTRY_SIZE..(pos + 1) * LOG_ENTRY_SIZE]
                    .copy_from_slice(&entry.encode());
            }
            dev.write_block(BlockId(self.layout.log_start + idx as u64), &buf)?;
        }
        dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_block::{ByteBlockDevice, MemByteDevice};

    const LOG_START: u64 = 64;

    fn device() -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::memory(512, 128).expect("device")
    }

    fn op(block: u64, fill: u8) -> BlockOperation {
        BlockOperation {
            block: BlockId(block),
            bytes: vec![fill; 512],
        }
    }

    fn read(dev: &dyn BlockDevice, block: u64) -> Vec<u8> {
        dev.read_block(BlockId(block)).expect("read").into_inner()
    }

    #[test]
    fn commit_applies_targets_and_appends_marker() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let txn = log.begin_txn();
        assert_eq!(txn, TxnId(1));

        log.append_log(&dev, txn, &[op(5, 0xAA), op(6, 0xBB)]).expect("append");
        assert_eq!(read(&dev, 5), vec![0; 512], "append must not touch targets");
        assert_eq!(log.entry_count(), 2);

        log.commit_log(&dev, txn).expect("commit");
        assert_eq!(read(&dev, 5), vec![0xAA; 512]);
        assert_eq!(read(&dev, 6), vec![0xBB; 512]);
        assert_eq!(log.entry_count(), 3);
        assert!(log.entries()[2].is_commit_marker());
    }

    #[test]
    fn checkpoint_reclaims_committed_and_retains_uncommitted() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let total = log.free_shadow_blocks(&dev).expect("free");

        let done = log.begin_txn();
        log.append_log(&dev, done, &[op(5, 1)]).expect("append");
        log.commit_log(&dev, done).expect("commit");

        let pending = log.begin_txn();
        log.append_log(&dev, pending, &[op(7, 2), op(8, 3)]).expect("append");

        let report = log.checkpoint(&dev).expect("checkpoint");
        assert_eq!(report.txns_reclaimed, 1);
        assert_eq!(report.entries_reclaimed, 2);
        assert_eq!(report.entries_retained, 2);
        assert_eq!(report.txns_redone, 0);
        assert_eq!(log.entry_count(), 2);
        assert!(log.entries().iter().all(|entry| entry.txn == pending));
        assert_eq!(log.free_shadow_blocks(&dev).expect("free"), total - 2);
        for entry in log.entries() {
            let fill = if entry.target == BlockId(7) { 2 } else { 3 };
            assert_eq!(read(&dev, entry.shadow.0), vec![fill; 512]);
        }
        assert_eq!(read(&dev, 7), vec![0; 512]);
    }

    #[test]
    fn reopen_rebuilds_entries_from_disk() {
        let dev = device();
        {
            let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
            let txn = log.begin_txn();
            log.append_log(&dev, txn, &[op(9, 4)]).expect("append");
            log.commit_log(&dev, txn).expect("commit");
            let txn = log.begin_txn();
            log.append_log(&dev, txn, &[op(10, 5)]).expect("append");
        }
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, false).expect("reopen");
        assert_eq!(log.entry_count(), 3);
        assert_eq!(log.current_txn(), TxnId(2));
        assert_eq!(log.begin_txn(), TxnId(3));
    }

    #[test]
    fn recover_discards_uncommitted_work() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let txn = log.begin_txn();
        log.append_log(&dev, txn, &[op(5, 9)]).expect("append");

        let report = log.recover(&dev).expect("recover");
        assert_eq!(report.txns_discarded, 1);
        assert_eq!(report.entries_discarded, 1);
        assert_eq!(report.txns_redone, 0);
        assert_eq!(read(&dev, 5), vec![0; 512]);
        assert_eq!(log.entry_count(), 0);
        assert_eq!(
            log.free_shadow_blocks(&dev).expect("free"),
            log.layout().data_blocks
        );
    }

    #[test]
    fn recover_redoes_committed_work_idempotently() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let txn = log.begin_txn();
        log.append_log(&dev, txn, &[op(5, 0x5A)]).expect("append");
        log.commit_log(&dev, txn).expect("commit");
        // Lose the in-place write, as if the crash hit before it landed.
        dev.write_block(BlockId(5), &[0_u8; 512]).expect("clobber");

        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, false).expect("reopen");
        let report = log.recover(&dev).expect("recover");
        assert_eq!(report.txns_redone, 1);
        assert_eq!(report.blocks_redone, 1);
        let once = read(&dev, 5);
        assert_eq!(once, vec![0x5A; 512]);

        let again = log.recover(&dev).expect("recover again");
        assert_eq!(again, RecoveryReport::default());
        assert_eq!(read(&dev, 5), once);
    }

    #[test]
    fn corrupt_shadow_blocks_commit() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let txn = log.begin_txn();
        log.append_log(&dev, txn, &[op(5, 1)]).expect("append");
        let shadow = log.entries()[0].shadow;
        dev.write_block(shadow, &[0xFF_u8; 512]).expect("corrupt");

        let err = log.commit_log(&dev, txn).unwrap_err();
        assert!(matches!(err, DfsError::Corruption { block, .. } if block == shadow.0));
        assert_eq!(log.entry_count(), 1, "no marker after failed verification");
        assert_eq!(read(&dev, 5), vec![0; 512]);
    }

    #[test]
    fn append_rejects_log_region_and_block_zero() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let txn = log.begin_txn();
        for block in [0, LOG_START, 100] {
            assert!(matches!(
                log.append_log(&dev, txn, &[op(block, 1)]),
                Err(DfsError::InvalidArg(_))
            ));
        }
        assert_eq!(log.entry_count(), 0);
    }

    #[test]
    fn full_log_reports_out_of_resource() {
        let dev = device();
        let mut log = ShadowLog::open(&dev, BlockId(LOG_START), 64, true).expect("open");
        let ops: Vec<BlockOperation> = (1..=59).map(|block| op(block, 1)).collect();
        let txn = log.begin_txn();
        assert!(!log.has_room(&dev, 64).expect("room"));
        assert!(log.has_room(&dev, 59).expect("room"));
        log.append_log(&dev, txn, &ops).expect("append");
        log.commit_log(&dev, txn).expect("commit");

        let next = log.begin_txn();
        assert!(!log.has_room(&dev, 1).expect("room"));
        assert!(matches!(
            log.append_log(&dev, next, &[op(60, 1)]),
            Err(DfsError::OutOfResource)
        ));
        log.checkpoint(&dev).expect("checkpoint");
        assert!(log.has_room(&dev, 1).expect("room"));
    }

    #[test]
    fn open_rejects_region_past_device_end() {
        let dev = device();
        assert!(ShadowLog::open(&dev, BlockId(100), 64, true).is_err());
    }
}
