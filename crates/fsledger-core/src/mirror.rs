//! Mirror existence transitions
//!
//! Every persistent state change carries a mirror existence change looked
//! up here. A combination missing from the table is an error, never coerced.

use fsledger_common::{MirrorExistenceState, PersistentState};

/// Mirror-side effect of a persistent state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorTransition {
    pub mirror: MirrorExistenceState,
    /// The owning transaction is cleared
    pub reset_owner: bool,
}

impl MirrorTransition {
    const fn keep(mirror: MirrorExistenceState, reset_owner: bool) -> Self {
        Self {
            mirror,
            reset_owner,
        }
    }
}

/// Look up the mirror transition for moving a record in `current` to `next`
#[must_use]
pub const fn mirror_transition(
    current: MirrorExistenceState,
    next: PersistentState,
) -> Option<MirrorTransition> {
    use MirrorExistenceState as M;

    match next {
        // Still pending: owner stays
        PersistentState::CreatePending => match current {
            M::NotMirrored
            | M::MirrorCreatePending
            | M::MirrorDownBeforeCreate
            | M::MirrorDownDuringCreate => Some(MirrorTransition::keep(current, false)),
            _ => None,
        },
        PersistentState::Created => match current {
            M::MirrorCreatePending => Some(MirrorTransition::keep(M::MirrorCreated, true)),
            M::NotMirrored | M::MirrorDownBeforeCreate | M::MirrorDownDuringCreate => {
                Some(MirrorTransition::keep(current, true))
            }
            _ => None,
        },
        PersistentState::DropPending => match current {
            M::MirrorCreated | M::MirrorDownDuringCreate => {
                Some(MirrorTransition::keep(M::MirrorDropPending, true))
            }
            M::NotMirrored | M::MirrorDownBeforeCreate => {
                Some(MirrorTransition::keep(current, true))
            }
            _ => None,
        },
        PersistentState::AbortingCreate => match current {
            M::MirrorCreatePending | M::MirrorDownDuringCreate => {
                Some(MirrorTransition::keep(M::MirrorDropPending, true))
            }
            M::NotMirrored | M::MirrorDownBeforeCreate => {
                Some(MirrorTransition::keep(current, true))
            }
            _ => None,
        },
        PersistentState::Free => match current {
            M::NotMirrored
            | M::MirrorDownBeforeCreate
            | M::MirrorDropPending
            | M::OnlyMirrorDropRemains => Some(MirrorTransition::keep(M::None, false)),
            _ => None,
        },
        PersistentState::JustInTimeCreatePending | PersistentState::BulkLoadCreatePending => None,
    }
}
