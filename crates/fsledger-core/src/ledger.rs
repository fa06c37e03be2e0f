//! Ledger assembly
//!
//! [`Ledger`] owns the four per-kind state machines together with the
//! handles they share: the WAL, the global sequences, the commit interlock
//! and the replication coordination lock. Opening a ledger runs recovery:
//! load each kind's checkpoint, replay the WAL tail, then the init scans.

use crate::cache::FilespaceCache;
use crate::directory::{DatabaseDirRecord, FilespaceDirRecord, TablespaceDirRecord};
use crate::edits::SegmentRemoval;
use crate::kind::ObjectKind;
use crate::lifecycle::{KindLedger, LifecycleOptions, StateChangeResult};
use crate::physical::DropRequest;
use crate::relation::RelationFileRecord;
use fsledger_common::{
    ItemLocator, LedgerConfig, MirrorExistenceState, ObjectKindTag, ObjectName, Oid,
    PersistentState, RelFileNode, Result, SerialNumber, TransactionId,
};
use fsledger_store::{
    CommitInterlock, FileWal, FlushMode, GlobalSequenceTable, InitScanSummary, Lsn, ObjectStore,
    PersistentRecord, StoreContext, StoreStats, WalSink, WalWriter,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Run `$body` with `$ledger` bound to the state machine of `$kind`
macro_rules! with_kind {
    ($self:ident, $kind:expr, $ledger:ident => $body:expr) => {
        match $kind {
            ObjectKindTag::RelationFile => {
                let $ledger = &$self.relations;
                $body
            }
            ObjectKindTag::DatabaseDir => {
                let $ledger = &$self.databases;
                $body
            }
            ObjectKindTag::TablespaceDir => {
                let $ledger = &$self.tablespaces;
                $body
            }
            ObjectKindTag::FilespaceDir => {
                let $ledger = &$self.filespaces;
                $body
            }
        }
    };
}

/// Outcome of opening a ledger
#[derive(Clone, Debug)]
pub struct RecoverySummary {
    /// WAL operations replayed on top of the checkpoints
    pub replayed: u64,
    pub scans: Vec<InitScanSummary>,
}

/// One live record as printed by the operator tooling
#[derive(Clone, Debug, Serialize)]
pub struct LedgerRow {
    pub kind: ObjectKindTag,
    pub locator: ItemLocator,
    pub serial: SerialNumber,
    pub name: ObjectName,
    pub state: String,
    pub mirror_existence: String,
    pub owner: TransactionId,
    pub detail: String,
}

/// Live record counts of one kind
#[derive(Clone, Debug, Default, Serialize)]
pub struct KindCounts {
    pub live: u64,
    pub create_pending: u64,
    pub created: u64,
    pub drop_pending: u64,
    pub aborting_create: u64,
    pub just_in_time_create_pending: u64,
    pub bulk_load_create_pending: u64,
}

impl KindCounts {
    fn count(&mut self, state: PersistentState) {
        self.live += 1;
        match state {
            PersistentState::CreatePending => self.create_pending += 1,
            PersistentState::Created => self.created += 1,
            PersistentState::DropPending => self.drop_pending += 1,
            PersistentState::AbortingCreate => self.aborting_create += 1,
            PersistentState::JustInTimeCreatePending => self.just_in_time_create_pending += 1,
            PersistentState::BulkLoadCreatePending => self.bulk_load_create_pending += 1,
            PersistentState::Free => self.live -= 1,
        }
    }
}

/// Result of [`Ledger::startup_integrity_check`]
#[derive(Clone, Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub counts: Vec<(ObjectKindTag, KindCounts)>,
    /// Database directories whose create never resolved
    pub pending_database_dirs: Vec<ObjectName>,
    /// Created relation files with no created database directory
    pub orphan_relation_files: Vec<ObjectName>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.pending_database_dirs.is_empty() && self.orphan_relation_files.is_empty()
    }
}

/// Physical drop inputs for one pending record
#[derive(Clone, Debug)]
pub struct DropTarget {
    pub request: DropRequest,
    pub state: PersistentState,
    pub mirror_existence: MirrorExistenceState,
}

/// The persistent object ledger
pub struct Ledger {
    relations: KindLedger<RelationFileRecord>,
    databases: KindLedger<DatabaseDirRecord>,
    tablespaces: KindLedger<TablespaceDirRecord>,
    filespaces: KindLedger<FilespaceDirRecord>,
    filespace_cache: Arc<FilespaceCache>,
    ctx: StoreContext,
    /// Shared by transitions that lead to a physical drop, exclusive for failover
    replication: RwLock<()>,
    config: LedgerConfig,
}

impl Ledger {
    /// Open the ledger under `config.data_dir`, running recovery
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal = FileWal::open(config.wal_path(), config.wal.clone())?;
        Self::open_with_wal(config, Arc::new(wal), Some(&config.data_dir))
    }

    /// Open over an arbitrary WAL; without `checkpoint_dir` tables live in memory
    pub fn open_with_wal(
        config: &LedgerConfig,
        sink: Arc<dyn WalSink>,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Self> {
        let ctx = StoreContext {
            wal: Arc::new(WalWriter::new(sink)),
            sequences: Arc::new(GlobalSequenceTable::new()),
            interlock: Arc::new(CommitInterlock::new()),
        };
        let options = LifecycleOptions::from(config);
        let filespace_cache = Arc::new(FilespaceCache::new());

        let ledger = Self {
            relations: KindLedger::new(open_store(&ctx, checkpoint_dir)?, options),
            databases: KindLedger::new(open_store(&ctx, checkpoint_dir)?, options),
            tablespaces: KindLedger::new(open_store(&ctx, checkpoint_dir)?, options),
            filespaces: KindLedger::new(open_store(&ctx, checkpoint_dir)?, options)
                .with_observer(filespace_cache.clone()),
            filespace_cache,
            ctx,
            replication: RwLock::new(()),
            config: config.clone(),
        };

        let summary = ledger.recover(config.recovery.repair_global_sequence)?;
        info!(
            "Ledger recovered: {} WAL operations replayed, {} live records",
            summary.replayed,
            summary.scans.iter().map(|s| s.in_use_count).sum::<u64>()
        );
        Ok(ledger)
    }

    fn recover(&self, repair_global_sequence: bool) -> Result<RecoverySummary> {
        let checkpoint_lsns: Vec<Lsn> = ObjectKindTag::ALL
            .iter()
            .map(|&kind| self.stats_of(kind).checkpoint_lsn)
            .collect();
        // New writes must land above every checkpoint or the next recovery skips them
        if let Some(&newest) = checkpoint_lsns.iter().max() {
            self.ctx.wal.sink().advance_to(newest);
        }
        // Each store skips operations its own checkpoint already covers
        let from = checkpoint_lsns.iter().min().copied().unwrap_or(0) + 1;

        let mut replayed = 0;
        self.ctx.wal.replay(from, |lsn, op| {
            replayed += 1;
            with_kind!(self, op.kind(), ledger => ledger.store().apply_replay(lsn, &op))
        })?;

        let scans = ObjectKindTag::ALL
            .iter()
            .map(|&kind| with_kind!(self, kind, ledger => ledger.init_scan(repair_global_sequence)))
            .collect::<Result<Vec<_>>>()?;

        Ok(RecoverySummary { replayed, scans })
    }

    pub const fn relations(&self) -> &KindLedger<RelationFileRecord> {
        &self.relations
    }

    pub const fn databases(&self) -> &KindLedger<DatabaseDirRecord> {
        &self.databases
    }

    pub const fn tablespaces(&self) -> &KindLedger<TablespaceDirRecord> {
        &self.tablespaces
    }

    pub const fn filespaces(&self) -> &KindLedger<FilespaceDirRecord> {
        &self.filespaces
    }

    pub fn filespace_cache(&self) -> &FilespaceCache {
        &self.filespace_cache
    }

    pub fn sequences(&self) -> &GlobalSequenceTable {
        &self.ctx.sequences
    }

    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub(crate) fn interlock(&self) -> &CommitInterlock {
        &self.ctx.interlock
    }

    /// Hold off failover while transitions and their physical drops run
    pub fn replication_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.replication.read_recursive()
    }

    /// Exclusive side of the replication lock, taken by failover edits
    pub fn replication_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.replication.write()
    }

    /// Make every deferred write durable
    pub fn flush_wal(&self) -> Result<()> {
        self.ctx.wal.flush_pending()
    }

    /// Checkpoint every kind and truncate the WAL they cover
    pub fn checkpoint(&self) -> Result<Option<Lsn>> {
        let guard = self.ctx.interlock.block_commits();
        self.ctx.wal.flush_all()?;

        let mut covered: Option<Lsn> = None;
        for kind in ObjectKindTag::ALL {
            let lsn = with_kind!(self, kind, ledger => ledger.store().checkpoint_locked(&guard))?;
            if let Some(lsn) = lsn {
                covered = Some(covered.map_or(lsn, |c| c.min(lsn)));
            }
        }

        if let Some(lsn) = covered {
            self.ctx.wal.sink().truncate_before(lsn + 1)?;
            info!("Ledger checkpoint complete at LSN {}", lsn);
        }
        Ok(covered)
    }

    fn stats_of(&self, kind: ObjectKindTag) -> StoreStats {
        with_kind!(self, kind, ledger => ledger.store().stats())
    }

    pub fn stats(&self) -> Vec<StoreStats> {
        ObjectKindTag::ALL
            .iter()
            .map(|&kind| self.stats_of(kind))
            .collect()
    }

    /// Bytes held by the WAL since the last checkpoint truncated it
    pub fn wal_size_bytes(&self) -> u64 {
        self.ctx.wal.sink().size_bytes()
    }

    /// Whether the WAL has reached `wal.max_size_bytes`
    pub fn checkpoint_advised(&self) -> bool {
        self.wal_size_bytes() >= self.config.wal.max_size_bytes
    }

    /// Move the record named `name` at `locator` to `next`
    pub fn transition(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        next: PersistentState,
        retry_allowed: bool,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        with_kind!(self, name.kind(), ledger => {
            ledger.transition(name, locator, serial, next, retry_allowed, flush)
        })
    }

    /// Free a record of `kind` without verification
    pub fn repair_delete(&self, kind: ObjectKindTag, locator: ItemLocator) -> Result<ObjectName> {
        with_kind!(self, kind, ledger => {
            ledger.repair_delete(locator, FlushMode::Sync).map(|r| r.name())
        })
    }

    /// Forget one half of a primary/mirror pair on a record of any kind
    #[allow(clippy::too_many_arguments)]
    pub fn remove_segment(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        db_id: i16,
        is_mirror: bool,
        flush: FlushMode,
    ) -> Result<SegmentRemoval> {
        let _failover = self.replication_exclusive();
        with_kind!(self, name.kind(), ledger => {
            ledger.remove_segment(name, locator, serial, db_id, is_mirror, flush)
        })
    }

    /// Re-point a record at the promoted standby
    pub fn activate_standby(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        old_master: i16,
        new_master: i16,
        flush: FlushMode,
    ) -> Result<()> {
        let _failover = self.replication_exclusive();
        with_kind!(self, name.kind(), ledger => {
            ledger.activate_standby(name, locator, serial, old_master, new_master, flush)
        })
    }

    /// Record a newly added mirror on a record of any kind
    #[allow(clippy::too_many_arguments)]
    pub fn add_mirror(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        primary_db_id: i16,
        mirror_db_id: i16,
        mirror_location: &str,
        set_mirror_existence: bool,
        flush: FlushMode,
    ) -> Result<bool> {
        let _failover = self.replication_exclusive();
        with_kind!(self, name.kind(), ledger => {
            ledger.add_mirror(
                name,
                locator,
                serial,
                primary_db_id,
                mirror_db_id,
                mirror_location,
                set_mirror_existence,
                flush,
            )
        })
    }

    /// Keep a dropped record around for its lost mirror drop
    pub fn mark_only_mirror_drop_remains(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        flush: FlushMode,
    ) -> Result<()> {
        with_kind!(self, name.kind(), ledger => {
            ledger.mark_only_mirror_drop_remains(name, locator, serial, flush)
        })
    }

    /// What the physical layer needs to drop the record at `locator`
    ///
    /// `None` when the slot no longer holds `name` with `serial`.
    pub fn drop_target(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
    ) -> Result<Option<DropTarget>> {
        let mut request = DropRequest::new(*name);
        let header = match name.kind() {
            ObjectKindTag::RelationFile => self.relations.read(locator)?.and_then(|r| {
                request.storage_manager = Some(r.storage_manager);
                matching(&r, name, serial)
            }),
            ObjectKindTag::DatabaseDir => self
                .databases
                .read(locator)?
                .and_then(|r| matching(&r, name, serial)),
            ObjectKindTag::TablespaceDir => self.tablespaces.read(locator)?.and_then(|r| {
                self.fill_filespace_locations(&mut request, r.filespace);
                matching(&r, name, serial)
            }),
            ObjectKindTag::FilespaceDir => self.filespaces.read(locator)?.and_then(|r| {
                self.fill_filespace_locations(&mut request, r.filespace);
                matching(&r, name, serial)
            }),
        };

        Ok(header.map(|(state, mirror_existence)| {
            request.primary_only = mirror_existence == MirrorExistenceState::MirrorDownBeforeCreate;
            DropTarget {
                request,
                state,
                mirror_existence,
            }
        }))
    }

    fn fill_filespace_locations(&self, request: &mut DropRequest, filespace: Oid) {
        let Some(entry) = self.filespace_cache.get(filespace) else {
            return;
        };
        let (primary, mirror) = match self.config.mirror.local_db_id {
            Some(db_id) => entry.locations_for(db_id),
            None => entry.locations_for(entry.db_id1),
        };
        request.primary_location = primary;
        request.mirror_location = mirror;
    }

    /// Live relation record for one segment file
    pub fn scan_for_relation(
        &self,
        node: RelFileNode,
        segment: i32,
    ) -> Option<(ItemLocator, RelationFileRecord)> {
        self.relations
            .store()
            .begin_scan()
            .find(|(_, _, r)| r.node == node && r.segment == segment)
            .map(|(locator, _, record)| (locator, record))
    }

    /// Printable rows for every live record of `kind`
    pub fn scan_rows(&self, kind: ObjectKindTag) -> Vec<LedgerRow> {
        match kind {
            ObjectKindTag::RelationFile => rows(&self.relations, |r| {
                format!(
                    "storage manager {}, sync '{}', ao loss/new EOF {}/{}, bufpool scan {} changed {} ckpt {:#x}/{}",
                    r.storage_manager,
                    r.data_sync_state,
                    r.ao_loss_eof,
                    r.ao_new_eof,
                    r.bufpool_marked_for_scan,
                    r.bufpool_changed_page_count,
                    r.bufpool_resync_ckpt_loc,
                    r.bufpool_resync_ckpt_block
                )
            }),
            ObjectKindTag::DatabaseDir => rows(&self.databases, |_| String::new()),
            ObjectKindTag::TablespaceDir => rows(&self.tablespaces, |_| String::new()),
            ObjectKindTag::FilespaceDir => rows(&self.filespaces, |r| {
                format!(
                    "db-id {} '{}', db-id {} '{}'",
                    r.db_id1, r.location1, r.db_id2, r.location2
                )
            }),
        }
    }

    /// Count live records and flag leftovers of interrupted creates
    pub fn startup_integrity_check(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        report.counts.push((ObjectKindTag::RelationFile, counts(&self.relations)));
        report.counts.push((ObjectKindTag::DatabaseDir, counts(&self.databases)));
        report.counts.push((ObjectKindTag::TablespaceDir, counts(&self.tablespaces)));
        report.counts.push((ObjectKindTag::FilespaceDir, counts(&self.filespaces)));

        let databases = self.databases.scan();
        for (locator, record) in &databases {
            if record.state().is_create_pending() {
                warn!(
                    "{} at {} is still in state '{}'",
                    record.name(),
                    locator,
                    record.state()
                );
                report.pending_database_dirs.push(record.name());
            }
        }

        for (locator, record) in self.relations.scan() {
            if record.state() != PersistentState::Created || record.node.database == 0 {
                continue;
            }
            let has_dir = databases.iter().any(|(_, d)| {
                d.state() == PersistentState::Created
                    && d.tablespace == record.node.tablespace
                    && d.database == record.node.database
            });
            if !has_dir {
                warn!("{} at {} has no created database directory", record.name(), locator);
                report.orphan_relation_files.push(record.name());
            }
        }

        info!(
            "Startup integrity check: {} pending database directories, {} orphan relation files",
            report.pending_database_dirs.len(),
            report.orphan_relation_files.len()
        );
        report
    }
}

fn open_store<R: PersistentRecord>(
    ctx: &StoreContext,
    checkpoint_dir: Option<&Path>,
) -> Result<ObjectStore<R>> {
    match checkpoint_dir {
        Some(dir) => ObjectStore::open(ctx.clone(), dir.join(format!("{}.ledger", R::KIND))),
        None => Ok(ObjectStore::new(ctx.clone())),
    }
}

fn matching<R: PersistentRecord>(
    record: &R,
    name: &ObjectName,
    serial: SerialNumber,
) -> Option<(PersistentState, MirrorExistenceState)> {
    (record.name() == *name && record.serial() == serial)
        .then(|| (record.state(), record.mirror_existence()))
}

fn rows<K: ObjectKind>(ledger: &KindLedger<K>, detail: impl Fn(&K) -> String) -> Vec<LedgerRow> {
    ledger
        .store()
        .begin_scan()
        .map(|(locator, serial, record)| LedgerRow {
            kind: K::KIND,
            locator,
            serial,
            name: record.name(),
            state: record.state().to_string(),
            mirror_existence: record.mirror_existence().to_string(),
            owner: record.header().owner,
            detail: detail(&record),
        })
        .collect()
}

fn counts<K: ObjectKind>(ledger: &KindLedger<K>) -> KindCounts {
    let mut counts = KindCounts::default();
    for (_, _, record) in ledger.store().begin_scan() {
        counts.count(record.state());
    }
    counts
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}
