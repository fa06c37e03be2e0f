//! Two-Phase Resolution Driver
//!
//! Applies one transaction's pending file-system actions at commit or
//! abort. The state changes of every action are made durable with a single
//! WAL flush before any physical drop is attempted, so a crash at any point
//! leaves the ledger in a state an identical rerun resolves:
//!
//! 1. move each record to its disposition (`Created`, `AbortingCreate`,
//!    `DropPending`) with retry allowed
//! 2. flush the WAL
//! 3. drop the physical objects of aborted creates and committed drops,
//!    then free their records
//! 4. on commit, write the append-only EOF catch-up markers
//! 5. flush the WAL

use crate::ledger::Ledger;
use crate::lifecycle::StateChangeResult;
use crate::physical::PhysicalDropper;
use fsledger_common::{Error, ItemLocator, ObjectName, PersistentState, Result, SerialNumber};
use fsledger_store::FlushMode;
use tracing::{debug, info, warn};

/// What the transaction did to an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Drop,
    /// The create must be undone whatever the transaction outcome
    AbortingCreateNeeded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub name: ObjectName,
    pub locator: ItemLocator,
    pub serial: SerialNumber,
    pub kind: ActionKind,
}

impl PendingAction {
    /// State the record must reach, or `None` when the action is a no-op
    #[must_use]
    pub const fn disposition(&self, commit: bool) -> Option<PersistentState> {
        match (self.kind, commit) {
            (ActionKind::Create, true) => Some(PersistentState::Created),
            (ActionKind::Create, false) | (ActionKind::AbortingCreateNeeded, _) => {
                Some(PersistentState::AbortingCreate)
            }
            (ActionKind::Drop, true) => Some(PersistentState::DropPending),
            (ActionKind::Drop, false) => None,
        }
    }
}

/// Append-only EOF the mirror must catch up to, written at commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEofMarker {
    pub name: ObjectName,
    pub locator: ItemLocator,
    pub serial: SerialNumber,
    pub mirror_catchup_required: bool,
    pub new_eof: i64,
}

/// Everything one transaction leaves to resolve
#[derive(Clone, Debug, Default)]
pub struct ResolutionBatch {
    pub commit: bool,
    pub actions: Vec<PendingAction>,
    pub eof_markers: Vec<PendingEofMarker>,
    /// Replaying a resolution during crash recovery
    pub recovery: bool,
}

/// What happened to one action
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub name: ObjectName,
    pub locator: ItemLocator,
    pub serial: SerialNumber,
    pub disposition: Option<PersistentState>,
    pub result: Option<StateChangeResult>,
    pub physically_dropped: bool,
    pub freed: bool,
    pub mirror_data_loss: bool,
}

#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub outcomes: Vec<ActionOutcome>,
    pub eof_markers_applied: usize,
    /// Non-fatal physical drop failures
    pub failures: Vec<Error>,
}

impl ResolutionReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ResolutionDriver<'a> {
    ledger: &'a Ledger,
    dropper: &'a dyn PhysicalDropper,
}

impl<'a> ResolutionDriver<'a> {
    pub fn new(ledger: &'a Ledger, dropper: &'a dyn PhysicalDropper) -> Self {
        Self { ledger, dropper }
    }

    /// Resolve `batch`
    ///
    /// Errors from the state changes or the EOF markers are returned after
    /// whatever was written has been flushed. Physical drop failures are
    /// reported in the result and leave the record for a rerun.
    pub fn resolve(&self, batch: &ResolutionBatch) -> Result<ResolutionReport> {
        let _replication = self.ledger.replication_shared();
        let _commit = self.ledger.interlock().enter();

        let mut report = ResolutionReport::default();
        let applied = self.apply_dispositions(batch, &mut report);
        self.ledger.flush_wal()?;
        applied?;

        let dropped = self
            .drop_physical(&mut report)
            .and_then(|()| self.apply_eof_markers(batch, &mut report));
        self.ledger.flush_wal()?;
        dropped?;

        info!(
            "Resolved {} actions ({}): {} dropped, {} freed, {} EOF markers, {} failures",
            report.outcomes.len(),
            if batch.commit { "commit" } else { "abort" },
            report.outcomes.iter().filter(|o| o.physically_dropped).count(),
            report.outcomes.iter().filter(|o| o.freed).count(),
            report.eof_markers_applied,
            report.failures.len()
        );
        Ok(report)
    }

    fn apply_dispositions(&self, batch: &ResolutionBatch, report: &mut ResolutionReport) -> Result<()> {
        for action in &batch.actions {
            let disposition = action.disposition(batch.commit);
            let result = match disposition {
                Some(next) => Some(self.ledger.transition(
                    &action.name,
                    action.locator,
                    action.serial,
                    next,
                    true,
                    FlushMode::Deferred,
                )?),
                None => None,
            };
            debug!(
                "{} at {}: disposition {:?}, result {:?}",
                action.name, action.locator, disposition, result
            );
            report.outcomes.push(ActionOutcome {
                name: action.name,
                locator: action.locator,
                serial: action.serial,
                disposition,
                result,
                physically_dropped: false,
                freed: false,
                mirror_data_loss: false,
            });
        }
        Ok(())
    }

    fn drop_physical(&self, report: &mut ResolutionReport) -> Result<()> {
        let retain = self.ledger.config().mirror.retain_on_data_loss;

        for outcome in &mut report.outcomes {
            let Some(disposition @ (PersistentState::AbortingCreate | PersistentState::DropPending)) =
                outcome.disposition
            else {
                continue;
            };
            // DeleteUnnecessary, Suppressed and Skipped leave nothing to drop
            let Some(result) = outcome.result.filter(|r| r.reached()) else {
                continue;
            };

            let Some(target) =
                self.ledger
                    .drop_target(&outcome.name, outcome.locator, outcome.serial)?
            else {
                continue;
            };
            if target.state != disposition {
                debug!(
                    "{} at {} moved on to '{}', not dropping",
                    outcome.name, outcome.locator, target.state
                );
                continue;
            }

            let mut request = target.request;
            request.ignore_missing = disposition == PersistentState::AbortingCreate
                || result == StateChangeResult::AlreadyDone;

            let dropped = match self.dropper.drop_object(&request) {
                Ok(dropped) => dropped,
                Err(e) => {
                    warn!("Physical drop of {} failed, record kept: {}", outcome.name, e);
                    report.failures.push(Error::PhysicalDropFailed {
                        name: outcome.name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            outcome.physically_dropped = true;
            outcome.mirror_data_loss = dropped.mirror_data_loss && !request.primary_only;

            if outcome.mirror_data_loss {
                warn!("Mirror data loss dropping {} at {}", outcome.name, outcome.locator);
                report.failures.push(Error::PhysicalDropFailed {
                    name: outcome.name,
                    reason: "mirror unreachable; primary copy dropped".to_string(),
                });
                if retain {
                    self.ledger.mark_only_mirror_drop_remains(
                        &outcome.name,
                        outcome.locator,
                        outcome.serial,
                        FlushMode::Deferred,
                    )?;
                    continue;
                }
            }

            self.ledger.transition(
                &outcome.name,
                outcome.locator,
                outcome.serial,
                PersistentState::Free,
                false,
                FlushMode::Deferred,
            )?;
            outcome.freed = true;
        }
        Ok(())
    }

    fn apply_eof_markers(&self, batch: &ResolutionBatch, report: &mut ResolutionReport) -> Result<()> {
        if !batch.commit {
            return Ok(());
        }
        for marker in &batch.eof_markers {
            let written = self.ledger.relations().update_append_only_resync_eofs(
                &marker.name,
                marker.locator,
                marker.serial,
                marker.mirror_catchup_required,
                marker.new_eof,
                batch.recovery,
                FlushMode::Deferred,
            )?;
            if written {
                report.eof_markers_applied += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::memory_ledger;
    use crate::physical::{DropOutcome, DropRequest};
    use fsledger_common::{
        LedgerConfig, MirrorExistenceState, RelFileNode, StorageManager, TransactionId,
    };
    use fsledger_store::{MemoryWal, PersistentRecord, WalSink};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingDropper {
        requests: Mutex<Vec<DropRequest>>,
        mirror_data_loss: bool,
        fail: Mutex<bool>,
        wal: Option<Arc<MemoryWal>>,
        /// Durable WAL position seen by each drop
        flushed_at_drop: Mutex<Vec<u64>>,
    }

    impl PhysicalDropper for RecordingDropper {
        fn drop_object(&self, request: &DropRequest) -> Result<DropOutcome> {
            if let Some(wal) = &self.wal {
                self.flushed_at_drop.lock().push(wal.flushed_lsn());
            }
            if *self.fail.lock() {
                return Err(Error::storage("segment unreachable"));
            }
            self.requests.lock().push(request.clone());
            Ok(DropOutcome {
                mirror_data_loss: self.mirror_data_loss,
            })
        }
    }

    fn add_relation(
        ledger: &Ledger,
        relation: u32,
        storage_manager: StorageManager,
        mirror: MirrorExistenceState,
    ) -> (ObjectName, ItemLocator, SerialNumber) {
        let node = RelFileNode::new(1663, 16384, relation);
        let (locator, serial) = ledger
            .relations()
            .mark_create_pending(
                node,
                0,
                storage_manager,
                mirror,
                TransactionId::new(51),
                FlushMode::Deferred,
            )
            .unwrap();
        (ObjectName::RelationFile { node, segment: 0 }, locator, serial)
    }

    fn action(
        (name, locator, serial): (ObjectName, ItemLocator, SerialNumber),
        kind: ActionKind,
    ) -> PendingAction {
        PendingAction {
            name,
            locator,
            serial,
            kind,
        }
    }

    fn batch(commit: bool, actions: Vec<PendingAction>) -> ResolutionBatch {
        ResolutionBatch {
            commit,
            actions,
            ..ResolutionBatch::default()
        }
    }

    fn created(ledger: &Ledger, relation: u32) -> (ObjectName, ItemLocator, SerialNumber) {
        let target = add_relation(
            ledger,
            relation,
            StorageManager::BufferPool,
            MirrorExistenceState::MirrorCreatePending,
        );
        ResolutionDriver::new(ledger, &RecordingDropper::default())
            .resolve(&batch(true, vec![action(target, ActionKind::Create)]))
            .unwrap();
        target
    }

    #[test]
    fn test_commit_create() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let dropper = RecordingDropper::default();
        let target = add_relation(
            &ledger,
            16385,
            StorageManager::BufferPool,
            MirrorExistenceState::MirrorCreatePending,
        );

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(true, vec![action(target, ActionKind::Create)]))
            .unwrap();

        assert_eq!(report.outcomes[0].result, Some(StateChangeResult::Ok));
        assert!(dropper.requests.lock().is_empty());
        let record = ledger.relations().read(target.1).unwrap().unwrap();
        assert_eq!(record.state(), PersistentState::Created);
        assert_eq!(record.header.owner, TransactionId::INVALID);
    }

    #[test]
    fn test_abort_create_drops_and_frees() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let dropper = RecordingDropper::default();
        let target = add_relation(
            &ledger,
            16386,
            StorageManager::AppendOnly,
            MirrorExistenceState::MirrorCreatePending,
        );

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(false, vec![action(target, ActionKind::Create)]))
            .unwrap();

        assert!(report.is_clean());
        assert!(report.outcomes[0].freed);
        let requests = dropper.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].ignore_missing);
        assert!(!requests[0].primary_only);
        assert_eq!(requests[0].storage_manager, Some(StorageManager::AppendOnly));
        assert_eq!(ledger.relations().read(target.1).unwrap(), None);
    }

    #[test]
    fn test_commit_drop_then_replay_is_delete_unnecessary() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = created(&ledger, 16387);
        let dropper = RecordingDropper::default();
        let drop_batch = batch(true, vec![action(target, ActionKind::Drop)]);

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&drop_batch)
            .unwrap();
        assert!(report.outcomes[0].freed);
        assert!(!dropper.requests.lock()[0].ignore_missing);

        // The record is already free: a replayed resolution drops nothing
        let replay_dropper = RecordingDropper::default();
        let report = ResolutionDriver::new(&ledger, &replay_dropper)
            .resolve(&drop_batch)
            .unwrap();
        assert_eq!(
            report.outcomes[0].result,
            Some(StateChangeResult::DeleteUnnecessary)
        );
        assert!(!report.outcomes[0].physically_dropped);
        assert!(replay_dropper.requests.lock().is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_drop_abort_is_noop() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = created(&ledger, 16388);
        let dropper = RecordingDropper::default();

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(false, vec![action(target, ActionKind::Drop)]))
            .unwrap();

        assert_eq!(report.outcomes[0].result, None);
        assert!(dropper.requests.lock().is_empty());
        assert_eq!(
            ledger.relations().read(target.1).unwrap().unwrap().state(),
            PersistentState::Created
        );
    }

    #[test]
    fn test_wal_durable_before_physical_drop() {
        let wal = Arc::new(MemoryWal::new());
        let ledger =
            Ledger::open_with_wal(&LedgerConfig::default(), wal.clone(), None).unwrap();
        let first = add_relation(
            &ledger,
            16389,
            StorageManager::BufferPool,
            MirrorExistenceState::NotMirrored,
        );
        let second = add_relation(
            &ledger,
            16390,
            StorageManager::BufferPool,
            MirrorExistenceState::NotMirrored,
        );
        let dropper = RecordingDropper {
            wal: Some(wal.clone()),
            ..RecordingDropper::default()
        };

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(
                true,
                vec![
                    action(first, ActionKind::AbortingCreateNeeded),
                    action(second, ActionKind::AbortingCreateNeeded),
                ],
            ))
            .unwrap();

        assert_eq!(dropper.requests.lock().len(), 2);
        assert!(report.outcomes.iter().all(|o| o.freed));
        // Two adds and two state changes were durable before the first drop
        assert_eq!(dropper.flushed_at_drop.lock()[0], 4);
        assert_eq!(wal.flushed_lsn(), wal.current_lsn());
    }

    #[test]
    fn test_mirror_data_loss_frees_by_default() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = created(&ledger, 16391);
        let dropper = RecordingDropper {
            mirror_data_loss: true,
            ..RecordingDropper::default()
        };

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(true, vec![action(target, ActionKind::Drop)]))
            .unwrap();

        assert!(report.outcomes[0].mirror_data_loss);
        assert!(report.outcomes[0].freed);
        assert!(matches!(
            report.failures[0],
            Error::PhysicalDropFailed { .. }
        ));
        assert_eq!(ledger.relations().read(target.1).unwrap(), None);
    }

    #[test]
    fn test_mirror_data_loss_retained() {
        let mut config = LedgerConfig::default();
        config.mirror.retain_on_data_loss = true;
        let ledger = memory_ledger(&config);
        let target = created(&ledger, 16392);
        let dropper = RecordingDropper {
            mirror_data_loss: true,
            ..RecordingDropper::default()
        };

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(true, vec![action(target, ActionKind::Drop)]))
            .unwrap();
        assert!(!report.outcomes[0].freed);
        let record = ledger.relations().read(target.1).unwrap().unwrap();
        assert_eq!(record.state(), PersistentState::DropPending);
        assert_eq!(
            record.mirror_existence(),
            MirrorExistenceState::OnlyMirrorDropRemains
        );

        // Removing the mirror releases the record
        let removal = ledger
            .remove_segment(&target.0, target.1, target.2, 2, true, FlushMode::Sync)
            .unwrap();
        assert_eq!(removal, crate::edits::SegmentRemoval::Freed);
    }

    #[test]
    fn test_failed_drop_is_retried() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = created(&ledger, 16393);
        let dropper = RecordingDropper::default();
        *dropper.fail.lock() = true;
        let drop_batch = batch(true, vec![action(target, ActionKind::Drop)]);

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&drop_batch)
            .unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            ledger.relations().read(target.1).unwrap().unwrap().state(),
            PersistentState::DropPending
        );

        *dropper.fail.lock() = false;
        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&drop_batch)
            .unwrap();
        assert_eq!(report.outcomes[0].result, Some(StateChangeResult::AlreadyDone));
        assert!(dropper.requests.lock()[0].ignore_missing);
        assert!(report.outcomes[0].freed);
    }

    #[test]
    fn test_mirror_down_before_create_drops_primary_only() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = add_relation(
            &ledger,
            16394,
            StorageManager::BufferPool,
            MirrorExistenceState::MirrorDownBeforeCreate,
        );
        let dropper = RecordingDropper {
            mirror_data_loss: true,
            ..RecordingDropper::default()
        };

        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(false, vec![action(target, ActionKind::Create)]))
            .unwrap();

        assert!(dropper.requests.lock()[0].primary_only);
        // A mirror that never had the file loses nothing
        assert!(!report.outcomes[0].mirror_data_loss);
        assert!(report.is_clean());
    }

    #[test]
    fn test_suppressed_action_skips_drop() {
        let config = LedgerConfig {
            state_change: fsledger_common::config::StateChangeConfig {
                suppress_errors: true,
            },
            ..LedgerConfig::default()
        };
        let ledger = memory_ledger(&config);
        let target = add_relation(
            &ledger,
            16395,
            StorageManager::BufferPool,
            MirrorExistenceState::NotMirrored,
        );
        let dropper = RecordingDropper::default();

        // DropPending requires Created; the mismatch is suppressed
        let report = ResolutionDriver::new(&ledger, &dropper)
            .resolve(&batch(true, vec![action(target, ActionKind::Drop)]))
            .unwrap();
        assert_eq!(report.outcomes[0].result, Some(StateChangeResult::Suppressed));
        assert!(dropper.requests.lock().is_empty());
    }

    #[test]
    fn test_commit_applies_eof_markers() {
        let ledger = memory_ledger(&LedgerConfig::default());
        let target = add_relation(
            &ledger,
            16396,
            StorageManager::AppendOnly,
            MirrorExistenceState::MirrorCreatePending,
        );
        let marker = PendingEofMarker {
            name: target.0,
            locator: target.1,
            serial: target.2,
            mirror_catchup_required: false,
            new_eof: 4096,
        };
        let mut commit = batch(true, vec![action(target, ActionKind::Create)]);
        commit.eof_markers.push(marker);

        let report = ResolutionDriver::new(&ledger, &RecordingDropper::default())
            .resolve(&commit)
            .unwrap();
        assert_eq!(report.eof_markers_applied, 1);
        let record = ledger.relations().read(target.1).unwrap().unwrap();
        assert_eq!((record.ao_loss_eof, record.ao_new_eof), (4096, 4096));

        // Replaying the same commit in recovery tolerates the equal EOF
        commit.recovery = true;
        let report = ResolutionDriver::new(&ledger, &RecordingDropper::default())
            .resolve(&commit)
            .unwrap();
        assert_eq!(report.eof_markers_applied, 0);

        commit.recovery = false;
        let err = ResolutionDriver::new(&ledger, &RecordingDropper::default())
            .resolve(&commit)
            .unwrap_err();
        assert!(matches!(err, Error::EofRegression { .. }));
    }
}
