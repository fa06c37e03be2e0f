//! Field-level edits that leave the persistent state alone
//!
//! Segment removal, standby activation and mirror addition during failover,
//! plus the resync markers the resync worker writes back. All of them go
//! through the same read-verify-rewrite discipline as state changes.

use crate::directory::DatabaseDirRecord;
use crate::kind::ObjectKind;
use crate::lifecycle::{KindLedger, StateChangeResult, verified};
use crate::relation::RelationFileRecord;
use fsledger_common::{
    Error, ItemLocator, MirrorDataSyncState, MirrorExistenceState, ObjectName, Oid,
    PersistentState, RelFileNode, Result, SerialNumber, StorageManager, TransactionId,
};
use fsledger_store::{FlushMode, PersistentRecord};
use tracing::{debug, info, warn};

/// What `remove_segment` did to the record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentRemoval {
    /// Only the mirror drop was left; the record is released
    Freed,
    Updated,
    Unchanged,
}

impl<K: ObjectKind> KindLedger<K> {
    /// Forget one half of a primary/mirror pair
    ///
    /// When the mirror goes away, a record whose only remaining work was the
    /// mirror drop is freed; any other record becomes `NotMirrored`.
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
        self.check_target(name, locator, serial)?;
        self.store().write(flush, |w| {
            let mut record = verified(w, name, locator, serial)?;
            let only_mirror_drop_left = matches!(
                record.state(),
                PersistentState::DropPending | PersistentState::AbortingCreate
            ) && record.mirror_existence()
                == MirrorExistenceState::OnlyMirrorDropRemains;

            if is_mirror && only_mirror_drop_left {
                let freed = w.free(locator)?;
                self.notify_free(locator, &freed);
                info!(
                    "Freed {} at {}: mirror removed with only its drop remaining",
                    name, locator
                );
                return Ok(SegmentRemoval::Freed);
            }

            let before = record.encode();
            if is_mirror {
                record.header_mut().mirror_existence = MirrorExistenceState::NotMirrored;
            }
            record.remove_segment_fields(db_id);
            if record.encode() == before {
                return Ok(SegmentRemoval::Unchanged);
            }

            w.update(locator, record.clone())?;
            self.notify_change(locator, &record);
            debug!("Removed segment db-id {} from {} at {}", db_id, name, locator);
            Ok(SegmentRemoval::Updated)
        })
    }

    /// Make the standby the master: the record is no longer mirrored
    pub fn activate_standby(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        old_master: i16,
        new_master: i16,
        flush: FlushMode,
    ) -> Result<()> {
        self.edit_verified(name, locator, serial, flush, |record| {
            let header = record.header_mut();
            header.owner = TransactionId::INVALID;
            header.mirror_existence = MirrorExistenceState::NotMirrored;
            record.activate_standby_fields(old_master, new_master)?;
            Ok(true)
        })?;
        debug!(
            "Activated standby for {} at {}: db-id {} -> {}",
            name, locator, old_master, new_master
        );
        Ok(())
    }

    /// Record a mirror added to `primary_db_id`
    ///
    /// With `set_mirror_existence` the record becomes
    /// `MirrorDownBeforeCreate` so the resync worker copies it. Returns
    /// whether the record changed.
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
        let updated = self.edit_verified(name, locator, serial, flush, |record| {
            let mut changed = false;
            if set_mirror_existence {
                record.header_mut().mirror_existence = MirrorExistenceState::MirrorDownBeforeCreate;
                changed = true;
            }
            changed |= record.add_mirror_fields(primary_db_id, mirror_db_id, mirror_location)?;
            Ok(changed)
        })?;
        Ok(updated.is_some())
    }

    /// The primary copy is gone but the mirror drop was lost
    ///
    /// The record keeps its pending state until the mirror is removed or
    /// the drop is retried.
    pub fn mark_only_mirror_drop_remains(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        flush: FlushMode,
    ) -> Result<()> {
        self.edit_verified(name, locator, serial, flush, |record| {
            let state = record.state();
            if !matches!(
                state,
                PersistentState::DropPending | PersistentState::AbortingCreate
            ) {
                return Err(Error::IllegalTransition {
                    name: *name,
                    locator,
                    actual: state,
                    next: state,
                    expected: vec![PersistentState::DropPending, PersistentState::AbortingCreate],
                });
            }
            record.header_mut().mirror_existence = MirrorExistenceState::OnlyMirrorDropRemains;
            Ok(true)
        })?;
        warn!("{} at {}: only the mirror drop remains", name, locator);
        Ok(())
    }
}

/// Buffer-pool resync progress kept on a relation file record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolResyncMarkers {
    pub marked_for_scan: bool,
    pub changed_page_count: i64,
    pub ckpt_loc: u64,
    pub ckpt_block: u32,
}

impl KindLedger<RelationFileRecord> {
    /// Add a relation segment file about to be created by `owner`
    pub fn mark_create_pending(
        &self,
        node: RelFileNode,
        segment: i32,
        storage_manager: StorageManager,
        mirror: MirrorExistenceState,
        owner: TransactionId,
        flush: FlushMode,
    ) -> Result<(ItemLocator, SerialNumber)> {
        self.add(
            RelationFileRecord::create_pending(node, segment, storage_manager, mirror, owner),
            flush,
        )
    }

    /// Add a relation segment file written by the bulk-load path
    pub fn mark_bulk_load_create_pending(
        &self,
        node: RelFileNode,
        segment: i32,
        storage_manager: StorageManager,
        mirror: MirrorExistenceState,
        owner: TransactionId,
        flush: FlushMode,
    ) -> Result<(ItemLocator, SerialNumber)> {
        self.add(
            RelationFileRecord::bulk_load_create_pending(
                node,
                segment,
                storage_manager,
                mirror,
                owner,
            ),
            flush,
        )
    }

    /// The bulk load finished; the file now commits or aborts like any create
    pub fn mark_create_pending_from_bulk_load(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        self.transition(
            name,
            locator,
            serial,
            PersistentState::CreatePending,
            false,
            flush,
        )
    }

    /// Move the append-only EOFs the mirror must catch up to
    ///
    /// Outside recovery the new EOF must grow. During recovery replay a
    /// smaller value is warned about and an equal one ignored; neither is
    /// written. Returns whether the record was updated.
    #[allow(clippy::too_many_arguments)]
    pub fn update_append_only_resync_eofs(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        mirror_catchup_required: bool,
        new_eof: i64,
        recovery: bool,
        flush: FlushMode,
    ) -> Result<bool> {
        let updated = self.edit_verified(name, locator, serial, flush, |record| {
            if record.storage_manager != StorageManager::AppendOnly {
                return Err(Error::StorageManagerMismatch {
                    name: *name,
                    actual: record.storage_manager,
                });
            }

            let current = record.ao_new_eof;
            if !recovery {
                if current >= new_eof {
                    return Err(Error::EofRegression {
                        name: *name,
                        current,
                        new: new_eof,
                    });
                }
            } else if current > new_eof {
                warn!(
                    "{} at {}: recovery new EOF {} is below current new EOF {}, keeping current",
                    name, locator, new_eof, current
                );
                return Ok(false);
            } else if current == new_eof {
                debug!("{} at {}: recovery new EOF {} already recorded", name, locator, new_eof);
                return Ok(false);
            }

            if !mirror_catchup_required {
                record.ao_loss_eof = new_eof;
            }
            record.ao_new_eof = new_eof;
            Ok(true)
        })?;
        Ok(updated.is_some())
    }

    /// Write back buffer-pool resync progress
    pub fn update_buffer_pool_resync_markers(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        markers: BufferPoolResyncMarkers,
        flush: FlushMode,
    ) -> Result<()> {
        self.edit_verified(name, locator, serial, flush, |record| {
            if record.storage_manager != StorageManager::BufferPool {
                return Err(Error::StorageManagerMismatch {
                    name: *name,
                    actual: record.storage_manager,
                });
            }
            record.bufpool_marked_for_scan = markers.marked_for_scan;
            record.bufpool_changed_page_count = markers.changed_page_count;
            record.bufpool_resync_ckpt_loc = markers.ckpt_loc;
            record.bufpool_resync_ckpt_block = markers.ckpt_block;
            Ok(true)
        })?;
        Ok(())
    }

    /// Record how far the mirror copy of a relation file has been synchronized
    pub fn set_data_sync_state(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        state: MirrorDataSyncState,
        flush: FlushMode,
    ) -> Result<()> {
        self.edit_verified(name, locator, serial, flush, |record| {
            let changed = record.data_sync_state != state;
            record.data_sync_state = state;
            Ok(changed)
        })?;
        Ok(())
    }
}

impl KindLedger<DatabaseDirRecord> {
    /// Add a database directory in a DDL create
    pub fn mark_create_pending(
        &self,
        tablespace: Oid,
        database: Oid,
        mirror: MirrorExistenceState,
        owner: TransactionId,
        flush: FlushMode,
    ) -> Result<(ItemLocator, SerialNumber)> {
        self.add(
            DatabaseDirRecord::create_pending(tablespace, database, mirror, owner),
            flush,
        )
    }

    /// Add a database directory created on first use
    pub fn mark_just_in_time_create_pending(
        &self,
        tablespace: Oid,
        database: Oid,
        mirror: MirrorExistenceState,
        owner: TransactionId,
        flush: FlushMode,
    ) -> Result<(ItemLocator, SerialNumber)> {
        self.add(
            DatabaseDirRecord::just_in_time(tablespace, database, mirror, owner),
            flush,
        )
    }
}
