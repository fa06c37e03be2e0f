//! Error types for the ledger
//!
//! Every variant carries the structured context (object name, locator,
//! states) needed to diagnose it; formatting happens where it is reported.

use crate::types::{
    ItemLocator, MirrorExistenceState, ObjectKindTag, ObjectName, PersistentState, SerialNumber,
    StorageManager,
};
use thiserror::Error;

/// Common result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ledger operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    // Object store errors
    #[error(
        "duplicate {candidate}: live record at {existing_locator} with serial {existing_serial} \
         is in state '{existing_state}', mirror '{existing_mirror}'"
    )]
    DuplicateRecord {
        candidate: ObjectName,
        existing_locator: ItemLocator,
        existing_serial: SerialNumber,
        existing_state: PersistentState,
        existing_mirror: MirrorExistenceState,
    },

    #[error("{kind} record at {locator} not found")]
    MissingRecord {
        kind: ObjectKindTag,
        locator: ItemLocator,
    },

    #[error("invalid {kind} locator {locator}")]
    InvalidLocator {
        kind: ObjectKindTag,
        locator: ItemLocator,
    },

    #[error("invalid serial number {serial} for {name}")]
    InvalidSerialNumber {
        name: ObjectName,
        serial: SerialNumber,
    },

    #[error("{kind} records are not initialized, run the init scan first")]
    NotInitialized { kind: ObjectKindTag },

    #[error(
        "{kind} global sequence {sequence} is behind the maximum serial number {max_serial} in use"
    )]
    SequenceCorruption {
        kind: ObjectKindTag,
        sequence: u64,
        max_serial: SerialNumber,
    },

    // Lifecycle errors
    #[error(
        "{name} at {locator}: state '{actual}' is not a legal predecessor of '{next}' (expected {})",
        state_list(.expected)
    )]
    IllegalTransition {
        name: ObjectName,
        locator: ItemLocator,
        actual: PersistentState,
        next: PersistentState,
        expected: Vec<PersistentState>,
    },

    #[error("{name} at {locator}: no mirror transition from '{mirror}' to state '{next}'")]
    IllegalMirrorTransition {
        name: ObjectName,
        locator: ItemLocator,
        mirror: MirrorExistenceState,
        next: PersistentState,
    },

    #[error("{name} at {locator}: expected serial number {expected}, found {actual}")]
    SerialNumberMismatch {
        name: ObjectName,
        locator: ItemLocator,
        expected: SerialNumber,
        actual: SerialNumber,
    },

    #[error("{name} uses the {actual} storage manager")]
    StorageManagerMismatch {
        name: ObjectName,
        actual: StorageManager,
    },

    #[error("{name}: append-only new EOF {current} is not below the requested {new}")]
    EofRegression { name: ObjectName, current: i64, new: i64 },

    // Resolution errors
    #[error("physical drop of {name} failed: {reason}")]
    PhysicalDropFailed { name: ObjectName, reason: String },

    // Checker errors
    #[error("consistency check failed: {violations} violations in {failed_checks} checks")]
    ConsistencyViolation {
        failed_checks: usize,
        violations: usize,
    },

    // Internal errors
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt ledger data: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn state_list(states: &[PersistentState]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(" or ")
}

impl Error {
    /// Create a WAL error
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::Wal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Errors raised while verifying a state change's preconditions
    ///
    /// These are the only errors the suppress mode may downgrade to a warning.
    #[must_use]
    pub const fn is_suppressible(&self) -> bool {
        matches!(
            self,
            Self::SerialNumberMismatch { .. }
                | Self::IllegalTransition { .. }
                | Self::IllegalMirrorTransition { .. }
                | Self::MissingRecord { .. }
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DiskIo(_) | Self::PhysicalDropFailed { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::MissingRecord { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelFileNode;

    fn relation() -> ObjectName {
        ObjectName::RelationFile {
            node: RelFileNode::new(1663, 1, 16384),
            segment: 0,
        }
    }

    #[test]
    fn test_error_suppressible() {
        let err = Error::SerialNumberMismatch {
            name: relation(),
            locator: ItemLocator::new(1, 1),
            expected: SerialNumber::new(4),
            actual: SerialNumber::new(5),
        };
        assert!(err.is_suppressible());
        assert!(!Error::wal("flush").is_suppressible());
    }

    #[test]
    fn test_error_not_found() {
        let err = Error::MissingRecord {
            kind: ObjectKindTag::RelationFile,
            locator: ItemLocator::new(2, 1),
        };
        assert!(err.is_not_found());
        assert!(!Error::corruption("bad").is_not_found());
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = Error::IllegalTransition {
            name: relation(),
            locator: ItemLocator::new(0, 1),
            actual: PersistentState::Free,
            next: PersistentState::Created,
            expected: vec![PersistentState::CreatePending],
        };
        let msg = err.to_string();
        assert!(msg.contains("'Free'"));
        assert!(msg.contains("expected 'Create Pending'"));
    }
}
