//! Per-kind behaviour of ledger records
//!
//! Each of the four object kinds implements [`ObjectKind`] on top of its
//! fixed-width [`PersistentRecord`]: the legal-predecessor table for state
//! changes and the kind-specific side of the field-level edits.

use fsledger_common::{PersistentState, Result};
use fsledger_store::PersistentRecord;

/// Predecessors shared by every kind
const TO_CREATED: &[PersistentState] = &[PersistentState::CreatePending];
const TO_DROP_PENDING: &[PersistentState] = &[PersistentState::Created];
const TO_ABORTING_CREATE: &[PersistentState] = &[PersistentState::CreatePending];
const TO_FREE: &[PersistentState] = &[PersistentState::DropPending, PersistentState::AbortingCreate];

/// Legal predecessors of `next` for kinds without extra create paths
#[must_use]
pub const fn common_predecessors(next: PersistentState) -> &'static [PersistentState] {
    match next {
        PersistentState::Created => TO_CREATED,
        PersistentState::DropPending => TO_DROP_PENDING,
        PersistentState::AbortingCreate => TO_ABORTING_CREATE,
        PersistentState::Free => TO_FREE,
        _ => &[],
    }
}

pub trait ObjectKind: PersistentRecord {
    /// States a record must be in to move to `next`
    ///
    /// An empty slice means `next` is not a valid transition target for
    /// this kind.
    fn legal_predecessors(next: PersistentState) -> &'static [PersistentState] {
        common_predecessors(next)
    }

    /// Rewrite kind-specific fields that change together with the state
    fn apply_state_change(&mut self, _next: PersistentState) {}

    /// Forget the half of a primary/mirror pair identified by `db_id`
    fn remove_segment_fields(&mut self, _db_id: i16) {}

    /// Move the old master's fields to the new master
    fn activate_standby_fields(&mut self, _old_master: i16, _new_master: i16) -> Result<()> {
        Ok(())
    }

    /// Record a newly added mirror; returns whether any field changed
    fn add_mirror_fields(
        &mut self,
        _primary_db_id: i16,
        _mirror_db_id: i16,
        _mirror_location: &str,
    ) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_table() {
        use PersistentState as S;

        assert_eq!(common_predecessors(S::Created), &[S::CreatePending]);
        assert_eq!(common_predecessors(S::Free), &[S::DropPending, S::AbortingCreate]);
        assert!(common_predecessors(S::CreatePending).is_empty());
        assert!(common_predecessors(S::JustInTimeCreatePending).is_empty());
    }
}
