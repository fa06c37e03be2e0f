//! Lifecycle State Machine
//!
//! [`KindLedger`] wraps one kind's [`ObjectStore`] and is the only path
//! through which records change state. Every change runs the same
//! read-verify-rewrite sequence inside a single store write:
//!
//! 1. read the record at the locator
//! 2. check the caller's serial number
//! 3. check the current state is a legal predecessor of the next one
//! 4. look up the mirror existence transition
//! 5. rewrite the record, or free it when the next state is `Free`

use crate::kind::ObjectKind;
use crate::mirror::mirror_transition;
use fsledger_common::{
    Error, ItemLocator, LedgerConfig, LedgerMode, ObjectName, PersistentState, Result,
    SerialNumber, TransactionId,
};
use fsledger_store::{FlushMode, InitScanSummary, ObjectStore, PersistentRecord, StoreWriter};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a state change request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChangeResult {
    /// The record moved to the requested state
    Ok,
    /// The record is already gone or reused; nothing to undo or drop
    DeleteUnnecessary,
    /// The record was already in the requested state
    AlreadyDone,
    /// A precondition failed and suppress mode turned the error into a warning
    Suppressed,
    /// Bootstrap mode: the ledger was not touched
    Skipped,
}

impl StateChangeResult {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "State-Change OK",
            Self::DeleteUnnecessary => "Delete Unnecessary",
            Self::AlreadyDone => "Already Done",
            Self::Suppressed => "Error Suppressed",
            Self::Skipped => "Skipped",
        }
    }

    /// Whether the record is now in the requested state
    #[must_use]
    pub const fn reached(self) -> bool {
        matches!(self, Self::Ok | Self::AlreadyDone)
    }
}

impl fmt::Display for StateChangeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives every record change of one kind
///
/// Calls happen while the store is locked; implementations must not call
/// back into the ledger.
pub trait RecordObserver<K>: Send + Sync {
    /// A record seen by the init scan
    fn on_scan(&self, locator: ItemLocator, record: &K);

    /// A record added or rewritten
    fn on_change(&self, locator: ItemLocator, record: &K);

    /// A record freed; `record` is its last image
    fn on_free(&self, locator: ItemLocator, record: &K);
}

/// Behaviour switches shared by every kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleOptions {
    pub mode: LedgerMode,
    /// Downgrade precondition failures to warnings
    pub suppress_errors: bool,
}

impl From<&LedgerConfig> for LifecycleOptions {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            mode: config.mode,
            suppress_errors: config.state_change.suppress_errors,
        }
    }
}

/// Lifecycle state machine for one object kind
pub struct KindLedger<K: ObjectKind> {
    store: ObjectStore<K>,
    options: LifecycleOptions,
    observer: Option<Arc<dyn RecordObserver<K>>>,
}

impl<K: ObjectKind> KindLedger<K> {
    pub fn new(store: ObjectStore<K>, options: LifecycleOptions) -> Self {
        Self {
            store,
            options,
            observer: None,
        }
    }

    /// Attach an observer notified of every change
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RecordObserver<K>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub const fn store(&self) -> &ObjectStore<K> {
        &self.store
    }

    pub const fn options(&self) -> LifecycleOptions {
        self.options
    }

    pub(crate) fn notify_change(&self, locator: ItemLocator, record: &K) {
        if let Some(observer) = &self.observer {
            observer.on_change(locator, record);
        }
    }

    pub(crate) fn notify_free(&self, locator: ItemLocator, record: &K) {
        if let Some(observer) = &self.observer {
            observer.on_free(locator, record);
        }
    }

    /// Rebuild the shared counters and the observer's view from the table
    pub fn init_scan(&self, repair_global_sequence: bool) -> Result<InitScanSummary> {
        let observer = self.observer.clone();
        self.store
            .init_scan(repair_global_sequence, |locator, record| {
                if let Some(observer) = &observer {
                    observer.on_scan(locator, record);
                }
            })
    }

    /// Add a record in one of the create-pending states
    ///
    /// In bootstrap mode nothing is written and the zero locator and
    /// serial number are returned.
    pub fn add(&self, record: K, flush: FlushMode) -> Result<(ItemLocator, SerialNumber)> {
        if self.options.mode.is_bootstrap() {
            return Ok((ItemLocator::ZERO, SerialNumber::ZERO));
        }
        if !record.state().is_create_pending() {
            return Err(Error::invalid_argument(format!(
                "{} must be added in a create-pending state, not '{}'",
                record.name(),
                record.state()
            )));
        }

        self.store.write(flush, |w| {
            let (locator, serial) = w.add(record)?;
            if let Some(added) = w.read(locator)? {
                debug!(
                    "Added {} at {} in state '{}', mirror '{}'",
                    added.name(),
                    locator,
                    added.state(),
                    added.mirror_existence()
                );
                self.notify_change(locator, added);
            }
            Ok((locator, serial))
        })
    }

    /// Read the record at `locator`
    pub fn read(&self, locator: ItemLocator) -> Result<Option<K>> {
        self.store.read(locator)
    }

    /// Live records in physical order
    pub fn scan(&self) -> Vec<(ItemLocator, K)> {
        self.store.snapshot()
    }

    /// Move the record at `locator` to `next`
    ///
    /// With `retry_allowed`, a record that is already gone when aborting or
    /// dropping yields `DeleteUnnecessary`, and a record already in `next`
    /// yields `AlreadyDone`. Precondition failures are errors unless
    /// suppress mode is on.
    pub fn transition(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        next: PersistentState,
        retry_allowed: bool,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        if self.options.mode.is_bootstrap() {
            return Ok(StateChangeResult::Skipped);
        }
        self.check_target(name, locator, serial)?;

        let expected = K::legal_predecessors(next);
        if expected.is_empty() {
            return Err(Error::invalid_argument(format!(
                "'{next}' is not a state change target for {name}"
            )));
        }

        let outcome = self.store.write(flush, |w| {
            self.verify_and_apply(w, name, locator, serial, next, expected, retry_allowed)
        });
        self.suppress(name, outcome)
    }

    pub(crate) fn check_target(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
    ) -> Result<()> {
        if locator.is_zero() {
            return Err(Error::InvalidLocator {
                kind: K::KIND,
                locator,
            });
        }
        if serial.is_zero() {
            return Err(Error::InvalidSerialNumber {
                name: *name,
                serial,
            });
        }
        Ok(())
    }

    /// Apply suppress mode to a state change outcome
    fn suppress(
        &self,
        name: &ObjectName,
        outcome: Result<StateChangeResult>,
    ) -> Result<StateChangeResult> {
        match outcome {
            Err(e) if self.options.suppress_errors && e.is_suppressible() => {
                warn!("Suppressed state change error for {}: {}", name, e);
                Ok(StateChangeResult::Suppressed)
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_and_apply(
        &self,
        w: &mut StoreWriter<'_, K>,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        next: PersistentState,
        expected: &[PersistentState],
        retry_allowed: bool,
    ) -> Result<StateChangeResult> {
        let retry_delete = retry_allowed
            && matches!(
                next,
                PersistentState::AbortingCreate | PersistentState::DropPending
            );

        let Some(current) = w.read(locator)?.cloned() else {
            if retry_delete {
                debug!("{} at {} already freed, '{}' unnecessary", name, locator, next);
                return Ok(StateChangeResult::DeleteUnnecessary);
            }
            return Err(Error::MissingRecord {
                kind: K::KIND,
                locator,
            });
        };

        if current.serial() != serial {
            if retry_delete {
                debug!(
                    "{} at {} now has serial number {}, '{}' unnecessary",
                    name,
                    locator,
                    current.serial(),
                    next
                );
                return Ok(StateChangeResult::DeleteUnnecessary);
            }
            return Err(Error::SerialNumberMismatch {
                name: *name,
                locator,
                expected: serial,
                actual: current.serial(),
            });
        }

        let actual = current.state();
        if !expected.contains(&actual) {
            if actual == next && retry_allowed {
                debug!("{} at {} already in state '{}'", name, locator, next);
                return Ok(StateChangeResult::AlreadyDone);
            }
            return Err(Error::IllegalTransition {
                name: *name,
                locator,
                actual,
                next,
                expected: expected.to_vec(),
            });
        }

        let mirror = current.mirror_existence();
        let effect = mirror_transition(mirror, next).ok_or(Error::IllegalMirrorTransition {
            name: *name,
            locator,
            mirror,
            next,
        })?;

        if next == PersistentState::Free {
            let freed = w.free(locator)?;
            self.notify_free(locator, &freed);
        } else {
            let mut record = current;
            let header = record.header_mut();
            header.state = next;
            header.mirror_existence = effect.mirror;
            if effect.reset_owner {
                header.owner = TransactionId::INVALID;
            }
            record.apply_state_change(next);
            w.update(locator, record.clone())?;
            self.notify_change(locator, &record);
        }

        debug!(
            "{} at {}: '{}' -> '{}', mirror '{}' -> '{}'",
            name, locator, actual, next, mirror, effect.mirror
        );
        Ok(StateChangeResult::Ok)
    }

    /// The create committed
    pub fn mark_created(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        retry_allowed: bool,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        self.transition(name, locator, serial, PersistentState::Created, retry_allowed, flush)
    }

    /// The create aborted; the object must be removed
    pub fn mark_aborting_create(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        retry_allowed: bool,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        self.transition(
            name,
            locator,
            serial,
            PersistentState::AbortingCreate,
            retry_allowed,
            flush,
        )
    }

    /// The drop committed; the object must be removed
    pub fn mark_drop_pending(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        retry_allowed: bool,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        self.transition(
            name,
            locator,
            serial,
            PersistentState::DropPending,
            retry_allowed,
            flush,
        )
    }

    /// The physical object is gone; release the record
    pub fn mark_dropped(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        flush: FlushMode,
    ) -> Result<StateChangeResult> {
        self.transition(name, locator, serial, PersistentState::Free, false, flush)
    }

    /// Free the record at `locator` without any verification
    ///
    /// Operator repair of a record the state machine cannot move.
    pub fn repair_delete(&self, locator: ItemLocator, flush: FlushMode) -> Result<K> {
        if locator.is_zero() {
            return Err(Error::InvalidLocator {
                kind: K::KIND,
                locator,
            });
        }
        let freed = self.store.write(flush, |w| {
            let freed = w.free(locator)?;
            self.notify_free(locator, &freed);
            Ok(freed)
        })?;
        info!(
            "Repair delete freed {} at {} (state '{}', serial number {})",
            freed.name(),
            locator,
            freed.state(),
            freed.serial()
        );
        Ok(freed)
    }

    /// Read, verify and rewrite one record without changing its state
    ///
    /// `edit` gets the verified record; returning `Ok(false)` leaves it
    /// untouched. Used by the field-level edits.
    pub(crate) fn edit_verified<F>(
        &self,
        name: &ObjectName,
        locator: ItemLocator,
        serial: SerialNumber,
        flush: FlushMode,
        edit: F,
    ) -> Result<Option<K>>
    where
        F: FnOnce(&mut K) -> Result<bool>,
    {
        self.check_target(name, locator, serial)?;
        self.store.write(flush, |w| {
            let mut record = verified(w, name, locator, serial)?;
            if !edit(&mut record)? {
                return Ok(None);
            }
            w.update(locator, record.clone())?;
            self.notify_change(locator, &record);
            Ok(Some(record))
        })
    }
}

/// Clone of the record at `locator` after checking its serial number
pub(crate) fn verified<K: ObjectKind>(
    w: &StoreWriter<'_, K>,
    name: &ObjectName,
    locator: ItemLocator,
    serial: SerialNumber,
) -> Result<K> {
    let record = w.require(locator)?;
    if record.serial() != serial {
        return Err(Error::SerialNumberMismatch {
            name: *name,
            locator,
            expected: serial,
            actual: record.serial(),
        });
    }
    Ok(record.clone())
}
