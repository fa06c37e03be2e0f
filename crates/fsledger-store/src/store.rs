//! Object Store
//!
//! One fixed-width record table per kind, combining the slot arena, the
//! shared ledger WAL and the global sequence counters:
//!
//! - every mutation is appended to the WAL before it becomes visible
//! - serial numbers come from the kind's counter and are never reissued
//! - recovery = checkpoint load + WAL replay + init scan

use crate::arena::SlotArena;
use crate::guard;
use crate::interlock::{CheckpointGuard, CommitInterlock};
use crate::record::PersistentRecord;
use crate::sequence::GlobalSequenceTable;
use crate::types::{CheckpointHeader, LedgerWalOp};
use crate::wal::{FlushMode, Lsn, WalWriter};
use fsledger_common::{Error, ItemLocator, ObjectKindTag, Result, SerialNumber};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-slot prefix in a checkpoint: generation, kind tag, occupied flag, padding
const SLOT_PREFIX_SIZE: usize = 8;

/// Handles shared by every kind's store
#[derive(Clone)]
pub struct StoreContext {
    pub wal: Arc<WalWriter>,
    pub sequences: Arc<GlobalSequenceTable>,
    pub interlock: Arc<CommitInterlock>,
}

/// Counters derived from the table contents
///
/// Only the store's locked write path mutates these.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSharedState {
    /// Live records
    pub in_use_count: u64,
    /// Highest serial number handed out
    pub max_in_use_serial: SerialNumber,
    /// Whether the init scan has run
    pub init_scan_done: bool,
}

/// Outcome of [`ObjectStore::init_scan`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitScanSummary {
    pub kind: ObjectKindTag,
    pub in_use_count: u64,
    pub max_serial: SerialNumber,
    /// The global sequence was behind and has been advanced
    pub repaired: bool,
    /// The scan had already run; nothing was recomputed
    pub already_done: bool,
}

/// Store statistics
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub kind: ObjectKindTag,
    pub in_use_count: u64,
    pub max_in_use_serial: SerialNumber,
    pub global_sequence: u64,
    pub slot_count: usize,
    pub checkpoint_lsn: Lsn,
    pub initialized: bool,
}

struct StoreInner<R> {
    arena: SlotArena<R>,
    shared: LedgerSharedState,
    /// WAL records up to this LSN are already in the loaded checkpoint
    checkpoint_lsn: Lsn,
}

/// Fixed-width record table for one kind
pub struct ObjectStore<R: PersistentRecord> {
    inner: RwLock<StoreInner<R>>,
    ctx: StoreContext,
    /// Checkpoint file; `None` keeps the table in memory only
    checkpoint_path: Option<PathBuf>,
}

impl<R: PersistentRecord> ObjectStore<R> {
    /// Create an empty store with no checkpoint file
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                arena: SlotArena::new(),
                shared: LedgerSharedState::default(),
                checkpoint_lsn: 0,
            }),
            ctx,
            checkpoint_path: None,
        }
    }

    /// Open a store backed by a checkpoint file, loading it if present
    pub fn open(ctx: StoreContext, checkpoint_path: impl AsRef<Path>) -> Result<Self> {
        let checkpoint_path = checkpoint_path.as_ref().to_path_buf();
        let (arena, checkpoint_lsn) = if checkpoint_path.exists() {
            let (arena, header) = load_checkpoint::<R>(&checkpoint_path)?;
            ctx.sequences.advance_to(R::KIND, header.sequence);
            info!(
                "Loaded {} checkpoint at LSN {} ({} live records in {} slots)",
                R::KIND,
                header.checkpoint_lsn,
                arena.len(),
                arena.slot_count()
            );
            (arena, header.checkpoint_lsn)
        } else {
            debug!("No {} checkpoint at {:?}", R::KIND, checkpoint_path);
            (SlotArena::new(), 0)
        };

        Ok(Self {
            inner: RwLock::new(StoreInner {
                arena,
                shared: LedgerSharedState::default(),
                checkpoint_lsn,
            }),
            ctx,
            checkpoint_path: Some(checkpoint_path),
        })
    }

    pub const fn kind(&self) -> ObjectKindTag {
        R::KIND
    }

    pub const fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Run `f` with exclusive access to the table
    ///
    /// Everything `f` does is one critical section: no other writer, reader
    /// or checkpoint observes an intermediate state.
    pub fn write<T>(
        &self,
        flush: FlushMode,
        f: impl FnOnce(&mut StoreWriter<'_, R>) -> Result<T>,
    ) -> Result<T> {
        let _commit = self.ctx.interlock.enter();
        let mut inner = self.inner.write();
        if !inner.shared.init_scan_done {
            return Err(Error::NotInitialized { kind: R::KIND });
        }
        let mut writer = StoreWriter {
            inner: &mut inner,
            wal: &self.ctx.wal,
            sequences: &self.ctx.sequences,
            flush,
        };
        f(&mut writer)
    }

    /// Insert a record, assigning its serial number
    pub fn add(&self, record: R, flush: FlushMode) -> Result<(ItemLocator, SerialNumber)> {
        self.write(flush, |w| w.add(record))
    }

    /// Read the record at `locator`; `None` if the slot is free or reused
    pub fn read(&self, locator: ItemLocator) -> Result<Option<R>> {
        check_locator::<R>(locator)?;
        Ok(self.inner.read_recursive().arena.get(locator).cloned())
    }

    /// Replace the record at `locator`
    pub fn update(&self, locator: ItemLocator, record: R, flush: FlushMode) -> Result<()> {
        self.write(flush, |w| w.update(locator, record))
    }

    /// Rewrite selected fields of the record at `locator`, returning the new image
    pub fn replace_fields(
        &self,
        locator: ItemLocator,
        flush: FlushMode,
        edit: impl FnOnce(&mut R),
    ) -> Result<R> {
        self.write(flush, |w| {
            let mut record = w.require(locator)?.clone();
            edit(&mut record);
            w.update(locator, record.clone())?;
            Ok(record)
        })
    }

    /// Free the record at `locator`, returning its last image
    pub fn free(&self, locator: ItemLocator, flush: FlushMode) -> Result<R> {
        self.write(flush, |w| w.free(locator))
    }

    /// Make every deferred write durable
    pub fn flush_wal(&self) -> Result<()> {
        self.ctx.wal.flush_pending()
    }

    /// Start a full scan in physical order
    ///
    /// The scan holds the table's shared lock until it is dropped or
    /// [`StoreScan::end_scan`] is called; do not write to this store while
    /// holding it.
    pub fn begin_scan(&self) -> StoreScan<'_, R> {
        StoreScan {
            inner: self.inner.read_recursive(),
            position: 0,
        }
    }

    /// Live records, cloned out of the table
    pub fn snapshot(&self) -> Vec<(ItemLocator, R)> {
        self.begin_scan().map(|(l, _, r)| (l, r)).collect()
    }

    /// Recompute the shared counters from the table contents
    ///
    /// Runs once; later calls return immediately with `already_done`. The
    /// visitor sees every live record so dependent caches can rebuild
    /// themselves. A global sequence behind the highest serial in use is
    /// `SequenceCorruption` unless `repair` is set.
    pub fn init_scan<F>(&self, repair: bool, mut visitor: F) -> Result<InitScanSummary>
    where
        F: FnMut(ItemLocator, &R),
    {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if inner.shared.init_scan_done {
            debug!("{} init scan already done", R::KIND);
            return Ok(InitScanSummary {
                kind: R::KIND,
                in_use_count: inner.shared.in_use_count,
                max_serial: inner.shared.max_in_use_serial,
                repaired: false,
                already_done: true,
            });
        }

        let mut in_use_count = 0u64;
        let mut max_serial = SerialNumber::ZERO;
        for (locator, record) in inner.arena.iter() {
            in_use_count += 1;
            max_serial = max_serial.max(record.serial());
            visitor(locator, record);
        }

        let sequence = self.ctx.sequences.get(R::KIND);
        let mut repaired = false;
        if sequence < max_serial.get() {
            if !repair {
                return Err(Error::SequenceCorruption {
                    kind: R::KIND,
                    sequence,
                    max_serial,
                });
            }
            warn!(
                "{} global sequence {} is behind maximum serial number {}, advancing it",
                R::KIND,
                sequence,
                max_serial
            );
            self.ctx.sequences.set(R::KIND, max_serial.get());
            repaired = true;
        } else {
            max_serial = SerialNumber::new(sequence);
        }

        inner.shared = LedgerSharedState {
            in_use_count,
            max_in_use_serial: max_serial,
            init_scan_done: true,
        };

        info!(
            "{} init scan: {} records in use, maximum serial number {}",
            R::KIND,
            in_use_count,
            max_serial
        );
        Ok(InitScanSummary {
            kind: R::KIND,
            in_use_count,
            max_serial,
            repaired,
            already_done: false,
        })
    }

    /// Apply one replayed WAL operation
    ///
    /// Operations already covered by the loaded checkpoint are skipped.
    pub fn apply_replay(&self, lsn: Lsn, op: &LedgerWalOp) -> Result<()> {
        if op.kind() != R::KIND {
            return Err(Error::corruption(format!(
                "{} operation replayed into the {} table",
                op.kind(),
                R::KIND
            )));
        }

        let mut inner = self.inner.write();
        if inner.shared.init_scan_done {
            return Err(Error::storage("cannot replay into an initialized table"));
        }
        if lsn <= inner.checkpoint_lsn {
            return Ok(());
        }

        match op {
            LedgerWalOp::Insert {
                locator,
                serial,
                image,
                ..
            } => {
                let record = R::decode(image)?;
                inner.arena.place(*locator, record)?;
                self.ctx.sequences.advance_to(R::KIND, serial.get());
            }
            LedgerWalOp::Update { locator, image, .. } => {
                let record = R::decode(image)?;
                let slot = inner.arena.get_mut(*locator).ok_or_else(|| {
                    Error::corruption(format!(
                        "replayed update at LSN {lsn} targets missing {} record {locator}",
                        R::KIND
                    ))
                })?;
                *slot = record;
            }
            LedgerWalOp::Free { locator, .. } => {
                if inner.arena.remove(*locator).is_none() {
                    return Err(Error::corruption(format!(
                        "replayed free at LSN {lsn} targets missing {} record {locator}",
                        R::KIND
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write a checkpoint, blocking ledger writes while it runs
    pub fn checkpoint(&self) -> Result<Option<Lsn>> {
        let guard = self.ctx.interlock.block_commits();
        self.ctx.wal.flush_all()?;
        self.checkpoint_locked(&guard)
    }

    /// Write a checkpoint while the caller already blocks ledger writes
    ///
    /// Returns the checkpoint LSN, or `None` for an in-memory store. The
    /// WAL must already be durable up to the current LSN.
    pub fn checkpoint_locked(&self, _guard: &CheckpointGuard<'_>) -> Result<Option<Lsn>> {
        let Some(path) = &self.checkpoint_path else {
            return Ok(None);
        };

        let lsn = self.ctx.wal.current_lsn();
        let mut inner = self.inner.write();
        let sequence = self.ctx.sequences.get(R::KIND);
        write_checkpoint(path, &inner.arena, lsn, sequence)?;
        inner.checkpoint_lsn = lsn;

        info!(
            "Wrote {} checkpoint at LSN {} ({} live records)",
            R::KIND,
            lsn,
            inner.arena.len()
        );
        Ok(Some(lsn))
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read_recursive();
        StoreStats {
            kind: R::KIND,
            in_use_count: inner.shared.in_use_count,
            max_in_use_serial: inner.shared.max_in_use_serial,
            global_sequence: self.ctx.sequences.get(R::KIND),
            slot_count: inner.arena.slot_count(),
            checkpoint_lsn: inner.checkpoint_lsn,
            initialized: inner.shared.init_scan_done,
        }
    }

    /// Copy of the shared counters
    pub fn shared_state(&self) -> LedgerSharedState {
        self.inner.read_recursive().shared.clone()
    }
}

fn check_locator<R: PersistentRecord>(locator: ItemLocator) -> Result<()> {
    if locator.is_zero() {
        return Err(Error::InvalidLocator {
            kind: R::KIND,
            locator,
        });
    }
    Ok(())
}

/// Exclusive access to one table inside [`ObjectStore::write`]
pub struct StoreWriter<'a, R> {
    inner: &'a mut StoreInner<R>,
    wal: &'a WalWriter,
    sequences: &'a GlobalSequenceTable,
    flush: FlushMode,
}

impl<R: PersistentRecord> StoreWriter<'_, R> {
    /// Read the record at `locator`; `None` if the slot is free or reused
    pub fn read(&self, locator: ItemLocator) -> Result<Option<&R>> {
        check_locator::<R>(locator)?;
        Ok(self.inner.arena.get(locator))
    }

    /// Read the record at `locator`, failing with `MissingRecord` if absent
    pub fn require(&self, locator: ItemLocator) -> Result<&R> {
        self.read(locator)?.ok_or(Error::MissingRecord {
            kind: R::KIND,
            locator,
        })
    }

    /// Live records in physical order
    pub fn iter(&self) -> impl Iterator<Item = (ItemLocator, &R)> {
        self.inner.arena.iter()
    }

    pub const fn shared(&self) -> &LedgerSharedState {
        &self.inner.shared
    }

    pub fn add(&mut self, mut record: R) -> Result<(ItemLocator, SerialNumber)> {
        if !record.state().is_live() {
            return Err(Error::invalid_argument(format!(
                "cannot add {} in state '{}'",
                record.name(),
                record.state()
            )));
        }

        guard::check_before_add(&record, self.inner.arena.iter())?;

        let serial = self.inner.shared.max_in_use_serial.next();
        record.header_mut().serial = serial;
        let locator = self.inner.arena.next_locator()?;

        self.wal.log(
            &LedgerWalOp::Insert {
                kind: R::KIND,
                locator,
                serial,
                image: record.encode(),
            },
            self.flush,
        )?;

        let name = record.name();
        let placed = self.inner.arena.insert(record)?;
        debug_assert_eq!(placed, locator);

        self.inner.shared.max_in_use_serial = serial;
        self.inner.shared.in_use_count += 1;
        self.sequences.set(R::KIND, serial.get());

        debug!("Added {} at {} with serial number {}", name, locator, serial);
        Ok((locator, serial))
    }

    pub fn update(&mut self, locator: ItemLocator, record: R) -> Result<()> {
        let current_serial = self.require(locator)?.serial();
        if !record.state().is_live() {
            return Err(Error::invalid_argument(format!(
                "cannot store {} in state '{}', free it instead",
                record.name(),
                record.state()
            )));
        }
        if record.serial() != current_serial {
            return Err(Error::invalid_argument(format!(
                "update of {} at {} changes serial number {} to {}",
                record.name(),
                locator,
                current_serial,
                record.serial()
            )));
        }

        self.wal.log(
            &LedgerWalOp::Update {
                kind: R::KIND,
                locator,
                image: record.encode(),
            },
            self.flush,
        )?;

        if let Some(slot) = self.inner.arena.get_mut(locator) {
            *slot = record;
        }
        Ok(())
    }

    pub fn free(&mut self, locator: ItemLocator) -> Result<R> {
        self.require(locator)?;

        self.wal.log(
            &LedgerWalOp::Free {
                kind: R::KIND,
                locator,
            },
            self.flush,
        )?;

        let record = self.inner.arena.remove(locator).ok_or(Error::MissingRecord {
            kind: R::KIND,
            locator,
        })?;
        self.inner.shared.in_use_count = self.inner.shared.in_use_count.saturating_sub(1);

        debug!(
            "Freed {} at {} (serial number {})",
            record.name(),
            locator,
            record.serial()
        );
        Ok(record)
    }
}

/// Lazy, non-restartable scan over one table
pub struct StoreScan<'a, R> {
    inner: RwLockReadGuard<'a, StoreInner<R>>,
    position: usize,
}

impl<R: PersistentRecord> StoreScan<'_, R> {
    /// Release the table
    pub fn end_scan(self) {}
}

impl<R: PersistentRecord> Iterator for StoreScan<'_, R> {
    type Item = (ItemLocator, SerialNumber, R);

    fn next(&mut self) -> Option<Self::Item> {
        let (index, locator, record) = self.inner.arena.next_from(self.position)?;
        self.position = index + 1;
        Some((locator, record.serial(), record.clone()))
    }
}

fn write_checkpoint<R: PersistentRecord>(
    path: &Path,
    arena: &SlotArena<R>,
    lsn: Lsn,
    sequence: u64,
) -> Result<()> {
    let slot_size = SLOT_PREFIX_SIZE + R::ENCODED_LEN;
    let mut body = Vec::with_capacity(arena.slot_count() * slot_size);
    for slot in arena.slot_images() {
        body.extend_from_slice(&slot.generation.to_le_bytes());
        body.push(R::KIND.as_u8());
        body.push(u8::from(slot.record.is_some()));
        body.extend_from_slice(&[0u8; 2]);
        match slot.record {
            Some(record) => body.extend_from_slice(&record.encode()),
            None => body.resize(body.len() + R::ENCODED_LEN, 0),
        }
    }

    let record_len = u32::try_from(R::ENCODED_LEN)
        .map_err(|_| Error::storage("record width does not fit a checkpoint header"))?;
    let mut header = CheckpointHeader::new(
        R::KIND,
        record_len,
        lsn,
        arena.slot_count() as u64,
        sequence,
    );
    header.checksum = crc32c::crc32c(&body);

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| Error::storage(format!("failed to create checkpoint: {e}")))?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::storage(format!("checkpoint rename failed: {e}")))?;
    Ok(())
}

fn load_checkpoint<R: PersistentRecord>(path: &Path) -> Result<(SlotArena<R>, CheckpointHeader)> {
    let data = std::fs::read(path)
        .map_err(|e| Error::storage(format!("failed to read checkpoint {}: {e}", path.display())))?;

    let header = CheckpointHeader::from_bytes(&data)
        .ok_or_else(|| Error::corruption(format!("bad checkpoint header in {}", path.display())))?;
    if header.version != CheckpointHeader::VERSION {
        return Err(Error::corruption(format!(
            "unsupported checkpoint version {}",
            header.version
        )));
    }
    if header.kind != R::KIND || header.record_len as usize != R::ENCODED_LEN {
        return Err(Error::corruption(format!(
            "checkpoint {} holds {} records of {} bytes, expected {} of {}",
            path.display(),
            header.kind,
            header.record_len,
            R::KIND,
            R::ENCODED_LEN
        )));
    }

    let body = &data[CheckpointHeader::SIZE..];
    let slot_size = SLOT_PREFIX_SIZE + R::ENCODED_LEN;
    let slot_count = usize::try_from(header.slot_count)
        .map_err(|_| Error::corruption("checkpoint slot count overflows"))?;
    if body.len() != slot_count * slot_size {
        return Err(Error::corruption(format!(
            "checkpoint body is {} bytes, expected {}",
            body.len(),
            slot_count * slot_size
        )));
    }
    if crc32c::crc32c(body) != header.checksum {
        return Err(Error::corruption(format!(
            "checkpoint {} checksum mismatch",
            path.display()
        )));
    }

    let mut slots = Vec::with_capacity(slot_count);
    for chunk in body.chunks_exact(slot_size) {
        let generation = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let record = if chunk[5] == 0 {
            None
        } else {
            Some(R::decode(&chunk[SLOT_PREFIX_SIZE..])?)
        };
        slots.push((generation, record));
    }

    Ok((SlotArena::from_slots(slots)?, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record::TestRecord;
    use crate::wal::{FileWal, MemoryWal, WalSink};
    use fsledger_common::{MirrorExistenceState, PersistentState, WalConfig};
    use rand::Rng;
    use tempfile::tempdir;

    fn memory_ctx() -> (StoreContext, Arc<MemoryWal>) {
        let sink = Arc::new(MemoryWal::new());
        let ctx = StoreContext {
            wal: Arc::new(WalWriter::new(sink.clone())),
            sequences: Arc::new(GlobalSequenceTable::new()),
            interlock: Arc::new(CommitInterlock::new()),
        };
        (ctx, sink)
    }

    fn ready_store() -> (ObjectStore<TestRecord>, Arc<MemoryWal>) {
        let (ctx, sink) = memory_ctx();
        let store = ObjectStore::new(ctx);
        store.init_scan(false, |_, _| {}).unwrap();
        (store, sink)
    }

    /// Rebuild a store from the WAL of another, as a restart would
    fn replay_into(ctx: StoreContext) -> ObjectStore<TestRecord> {
        let store = ObjectStore::new(ctx.clone());
        ctx.wal
            .replay(1, |lsn, op| store.apply_replay(lsn, &op))
            .unwrap();
        store
    }

    #[test]
    fn test_add_read_roundtrip() {
        let (store, _) = ready_store();
        let record = TestRecord::created(1);

        let (locator, serial) = store.add(record.clone(), FlushMode::Sync).unwrap();
        assert_eq!(serial, SerialNumber::new(1));

        let mut expected = record;
        expected.header.serial = serial;
        assert_eq!(store.read(locator).unwrap(), Some(expected));
        assert_eq!(store.shared_state().in_use_count, 1);
    }

    #[test]
    fn test_zero_locator_rejected() {
        let (store, _) = ready_store();
        let err = store.read(ItemLocator::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidLocator { .. }));
    }

    #[test]
    fn test_writes_require_init_scan() {
        let (ctx, _) = memory_ctx();
        let store = ObjectStore::<TestRecord>::new(ctx);
        let err = store
            .add(TestRecord::created(1), FlushMode::Sync)
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized { .. }));
    }

    #[test]
    fn test_duplicate_rejected_until_freed() {
        let (store, _) = ready_store();
        let (locator, _) = store.add(TestRecord::created(9), FlushMode::Sync).unwrap();

        let err = store
            .add(TestRecord::created(9), FlushMode::Sync)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRecord { .. }));

        store.free(locator, FlushMode::Sync).unwrap();
        let (reused, serial) = store.add(TestRecord::created(9), FlushMode::Sync).unwrap();
        assert_eq!(reused, ItemLocator::new(0, 2));
        assert_eq!(serial, SerialNumber::new(2));
        assert_eq!(store.read(locator).unwrap(), None);
    }

    #[test]
    fn test_free_updates_count() {
        let (store, _) = ready_store();
        let (a, _) = store.add(TestRecord::created(1), FlushMode::Sync).unwrap();
        store.add(TestRecord::created(2), FlushMode::Sync).unwrap();

        let freed = store.free(a, FlushMode::Sync).unwrap();
        assert_eq!(freed.key, 1);
        assert_eq!(store.shared_state().in_use_count, 1);
        assert!(store.free(a, FlushMode::Sync).unwrap_err().is_not_found());
    }

    #[test]
    fn test_replace_fields_logs_new_image() {
        let (store, sink) = ready_store();
        let (locator, serial) = store.add(TestRecord::created(3), FlushMode::Sync).unwrap();

        let updated = store
            .replace_fields(locator, FlushMode::Deferred, |r| {
                r.header.mirror_existence = MirrorExistenceState::MirrorDropPending;
                r.header.state = PersistentState::DropPending;
            })
            .unwrap();
        assert_eq!(updated.serial(), serial);
        assert_eq!(sink.current_lsn(), 2);
        assert_eq!(sink.flushed_lsn(), 1);

        store.flush_wal().unwrap();
        assert_eq!(sink.flushed_lsn(), 2);

        let stored = store.read(locator).unwrap().unwrap();
        assert_eq!(stored.state(), PersistentState::DropPending);
    }

    #[test]
    fn test_update_cannot_free_or_reserial() {
        let (store, _) = ready_store();
        let (locator, _) = store.add(TestRecord::created(3), FlushMode::Sync).unwrap();
        let mut record = store.read(locator).unwrap().unwrap();

        record.header.state = PersistentState::Free;
        assert!(store.update(locator, record.clone(), FlushMode::Sync).is_err());

        record.header.state = PersistentState::Created;
        record.header.serial = SerialNumber::new(99);
        assert!(store.update(locator, record, FlushMode::Sync).is_err());
    }

    #[test]
    fn test_scan_physical_order() {
        let (store, _) = ready_store();
        let mut locators = vec![];
        for key in 0..4 {
            locators.push(store.add(TestRecord::created(key), FlushMode::Sync).unwrap().0);
        }
        store.free(locators[1], FlushMode::Sync).unwrap();

        let mut scan = store.begin_scan();
        let first = scan.next().unwrap();
        assert_eq!((first.0, first.1), (locators[0], SerialNumber::new(1)));
        let rest: Vec<_> = scan.map(|(_, _, r)| r.key).collect();
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_init_scan_runs_once() {
        let (ctx, _) = memory_ctx();
        let writer_store = ObjectStore::<TestRecord>::new(ctx.clone());
        writer_store.init_scan(false, |_, _| {}).unwrap();
        for key in 0..3 {
            writer_store
                .add(TestRecord::created(key), FlushMode::Sync)
                .unwrap();
        }

        let store = replay_into(ctx);
        let mut visited = 0;
        let first = store.init_scan(false, |_, _| visited += 1).unwrap();
        assert_eq!(first.in_use_count, 3);
        assert!(!first.already_done);
        assert_eq!(visited, 3);

        let second = store.init_scan(false, |_, _| visited += 1).unwrap();
        assert!(second.already_done);
        assert_eq!(second.in_use_count, 3);
        assert_eq!(visited, 3);
        assert_eq!(store.shared_state().in_use_count, 3);
    }

    #[test]
    fn test_sequence_behind_max_serial() {
        let (ctx, _) = memory_ctx();
        let original = ObjectStore::<TestRecord>::new(ctx.clone());
        original.init_scan(false, |_, _| {}).unwrap();
        for key in 0..5 {
            original.add(TestRecord::created(key), FlushMode::Sync).unwrap();
        }

        let restarted = replay_into(ctx.clone());
        ctx.sequences.set(ObjectKindTag::RelationFile, 2);
        let err = restarted.init_scan(false, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::SequenceCorruption { .. }));

        let summary = restarted.init_scan(true, |_, _| {}).unwrap();
        assert!(summary.repaired);
        assert_eq!(summary.max_serial, SerialNumber::new(5));
        assert_eq!(ctx.sequences.get(ObjectKindTag::RelationFile), 5);
    }

    #[test]
    fn test_serials_monotonic_across_restart() {
        let mut rng = rand::thread_rng();
        let (ctx, sink) = memory_ctx();
        let store = ObjectStore::<TestRecord>::new(ctx);
        store.init_scan(false, |_, _| {}).unwrap();

        let mut live: Vec<ItemLocator> = vec![];
        let mut last_serial = SerialNumber::ZERO;
        for key in 0..200u32 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                store.free(victim, FlushMode::Deferred).unwrap();
            }
            let (locator, serial) = store
                .add(TestRecord::created(key), FlushMode::Deferred)
                .unwrap();
            assert!(serial > last_serial);
            last_serial = serial;
            live.push(locator);
        }
        store.flush_wal().unwrap();

        // Restart from the durable WAL only
        let crashed = Arc::new(sink.crash());
        let ctx = StoreContext {
            wal: Arc::new(WalWriter::new(crashed)),
            sequences: Arc::new(GlobalSequenceTable::new()),
            interlock: Arc::new(CommitInterlock::new()),
        };
        let restarted = replay_into(ctx);
        let summary = restarted.init_scan(false, |_, _| {}).unwrap();
        assert_eq!(summary.in_use_count, live.len() as u64);
        assert_eq!(summary.max_serial, last_serial);

        let max_live = restarted
            .begin_scan()
            .map(|(_, serial, _)| serial)
            .max()
            .unwrap();
        assert!(summary.max_serial >= max_live);

        let (_, next) = restarted
            .add(TestRecord::created(10_000), FlushMode::Sync)
            .unwrap();
        assert_eq!(next, last_serial.next());
    }

    #[test]
    fn test_checkpoint_then_replay_tail() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("ledger.wal");
        let ckpt_path = dir.path().join("relation.ledger");
        let config = WalConfig {
            sync_on_write: false,
            max_size_bytes: 1024 * 1024,
            write_buffer_size: 4096,
        };

        let make_ctx = |sink: Arc<dyn WalSink>| StoreContext {
            wal: Arc::new(WalWriter::new(sink)),
            sequences: Arc::new(GlobalSequenceTable::new()),
            interlock: Arc::new(CommitInterlock::new()),
        };

        let (a, b) = {
            let ctx = make_ctx(Arc::new(FileWal::create(&wal_path, config.clone()).unwrap()));
            let store = ObjectStore::<TestRecord>::open(ctx, &ckpt_path).unwrap();
            store.init_scan(false, |_, _| {}).unwrap();

            let (a, _) = store.add(TestRecord::created(1), FlushMode::Sync).unwrap();
            let (b, _) = store.add(TestRecord::created(2), FlushMode::Sync).unwrap();
            assert_eq!(store.checkpoint().unwrap(), Some(2));

            // After the checkpoint: only in the WAL
            store.free(a, FlushMode::Sync).unwrap();
            store.add(TestRecord::created(3), FlushMode::Sync).unwrap();
            (a, b)
        };

        let ctx = make_ctx(Arc::new(FileWal::open(&wal_path, config).unwrap()));
        let store = ObjectStore::<TestRecord>::open(ctx.clone(), &ckpt_path).unwrap();
        assert_eq!(store.stats().checkpoint_lsn, 2);
        assert_eq!(ctx.sequences.get(ObjectKindTag::RelationFile), 2);

        ctx.wal
            .replay(1, |lsn, op| store.apply_replay(lsn, &op))
            .unwrap();
        let summary = store.init_scan(false, |_, _| {}).unwrap();
        assert_eq!(summary.in_use_count, 2);
        assert_eq!(summary.max_serial, SerialNumber::new(3));

        assert_eq!(store.read(a).unwrap(), None);
        assert_eq!(store.read(b).unwrap().unwrap().key, 2);
        let keys: Vec<_> = store.snapshot().into_iter().map(|(_, r)| r.key).collect();
        assert_eq!(keys, vec![3, 2]);
    }

    #[test]
    fn test_corrupt_checkpoint_rejected() {
        let dir = tempdir().unwrap();
        let ckpt_path = dir.path().join("relation.ledger");
        let (ctx, _) = memory_ctx();
        {
            let store = ObjectStore::<TestRecord>::open(ctx.clone(), &ckpt_path).unwrap();
            store.init_scan(false, |_, _| {}).unwrap();
            store.add(TestRecord::created(1), FlushMode::Sync).unwrap();
            store.checkpoint().unwrap();
        }

        let mut data = std::fs::read(&ckpt_path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&ckpt_path, data).unwrap();

        let err = ObjectStore::<TestRecord>::open(ctx, &ckpt_path)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
