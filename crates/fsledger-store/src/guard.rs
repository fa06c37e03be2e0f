//! Duplicate guard
//!
//! Runs before every insert: a second live record for the same logical key
//! is refused unless the record type's `allows_duplicate_of` accepts the pair.

use crate::record::PersistentRecord;
use fsledger_common::{Error, ItemLocator, MirrorExistenceState, PersistentState, Result};
use tracing::{error, warn};

/// The one known race where two live records may share a key
///
/// A create aborted while the mirror was being removed can leave its record
/// behind as `OnlyMirrorDropRemains`; a new create of the same key with the
/// mirror already down must still be able to proceed.
#[must_use]
pub fn abort_race_exception(
    existing_state: PersistentState,
    existing_mirror: MirrorExistenceState,
    candidate_state: PersistentState,
    candidate_mirror: MirrorExistenceState,
) -> bool {
    matches!(
        existing_state,
        PersistentState::AbortingCreate | PersistentState::DropPending
    ) && existing_mirror == MirrorExistenceState::OnlyMirrorDropRemains
        && candidate_state == PersistentState::CreatePending
        && candidate_mirror == MirrorExistenceState::MirrorDownBeforeCreate
}

/// Refuse `candidate` if a conflicting live record exists
pub fn check_before_add<'a, R, I>(candidate: &R, existing: I) -> Result<()>
where
    R: PersistentRecord,
    I: IntoIterator<Item = (ItemLocator, &'a R)>,
{
    let key = candidate.key();
    for (locator, record) in existing {
        if !record.state().is_live() || record.key() != key {
            continue;
        }

        if candidate.allows_duplicate_of(record) {
            warn!(
                candidate = ?candidate,
                existing = ?record,
                "Allowing duplicate {} next to record at {}",
                candidate.name(),
                locator
            );
            continue;
        }

        error!(
            candidate = ?candidate,
            existing = ?record,
            "Duplicate {} conflicts with record at {}",
            candidate.name(),
            locator
        );
        return Err(Error::DuplicateRecord {
            candidate: candidate.name(),
            existing_locator: locator,
            existing_serial: record.serial(),
            existing_state: record.state(),
            existing_mirror: record.mirror_existence(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record::TestRecord;

    #[test]
    fn test_exception_is_narrow() {
        use MirrorExistenceState as M;
        use PersistentState as S;

        assert!(abort_race_exception(
            S::AbortingCreate,
            M::OnlyMirrorDropRemains,
            S::CreatePending,
            M::MirrorDownBeforeCreate
        ));
        assert!(abort_race_exception(
            S::DropPending,
            M::OnlyMirrorDropRemains,
            S::CreatePending,
            M::MirrorDownBeforeCreate
        ));
        assert!(!abort_race_exception(
            S::Created,
            M::OnlyMirrorDropRemains,
            S::CreatePending,
            M::MirrorDownBeforeCreate
        ));
        assert!(!abort_race_exception(
            S::AbortingCreate,
            M::MirrorDropPending,
            S::CreatePending,
            M::MirrorDownBeforeCreate
        ));
        assert!(!abort_race_exception(
            S::AbortingCreate,
            M::OnlyMirrorDropRemains,
            S::CreatePending,
            M::MirrorCreatePending
        ));
    }

    #[test]
    fn test_conflict_reports_existing_record() {
        let mut existing = TestRecord::created(5);
        existing.header.serial = fsledger_common::SerialNumber::new(3);
        let other = TestRecord::created(6);
        let table = [
            (ItemLocator::new(0, 1), &other),
            (ItemLocator::new(1, 4), &existing),
        ];

        let err = check_before_add(&TestRecord::created(5), table).unwrap_err();
        match err {
            Error::DuplicateRecord {
                existing_locator,
                existing_serial,
                ..
            } => {
                assert_eq!(existing_locator, ItemLocator::new(1, 4));
                assert_eq!(existing_serial.get(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(check_before_add(&TestRecord::created(7), table).is_ok());
    }

    #[test]
    fn test_exception_applies_through_record_policy() {
        let existing = TestRecord::new(
            5,
            PersistentState::AbortingCreate,
            MirrorExistenceState::OnlyMirrorDropRemains,
        );
        let table = [(ItemLocator::new(0, 1), &existing)];

        let racing = TestRecord::new(
            5,
            PersistentState::CreatePending,
            MirrorExistenceState::MirrorDownBeforeCreate,
        );
        assert!(check_before_add(&racing, table).is_ok());

        let normal = TestRecord::new(
            5,
            PersistentState::CreatePending,
            MirrorExistenceState::MirrorCreatePending,
        );
        assert!(check_before_add(&normal, table).is_err());
    }
}
