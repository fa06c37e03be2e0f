//! Boundary to the physical I/O layer
//!
//! The ledger never touches data files itself. The resolution driver hands
//! each object whose record reached `AbortingCreate` or `DropPending` to a
//! [`PhysicalDropper`] and finalizes the record from the outcome.

use fsledger_common::{ObjectName, Result, StorageManager};

/// One physical object to remove on the primary and, unless `primary_only`, its mirror
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DropRequest {
    pub name: ObjectName,
    /// Set for relation files
    pub storage_manager: Option<StorageManager>,
    /// The mirror never got the object
    pub primary_only: bool,
    /// A missing file is not an error
    pub ignore_missing: bool,
    /// Filespace directory locations, when the object is a filespace
    pub primary_location: Option<String>,
    pub mirror_location: Option<String>,
}

impl DropRequest {
    #[must_use]
    pub const fn new(name: ObjectName) -> Self {
        Self {
            name,
            storage_manager: None,
            primary_only: false,
            ignore_missing: false,
            primary_location: None,
            mirror_location: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropOutcome {
    /// The primary copy is gone but the mirror could not be reached
    pub mirror_data_loss: bool,
}

/// Removes physical objects on behalf of the resolution driver
pub trait PhysicalDropper: Send + Sync {
    /// Remove the object named by `request`
    ///
    /// An error means the primary copy may still exist; the record is left
    /// in its pending state so an identical retry drops it again.
    fn drop_object(&self, request: &DropRequest) -> Result<DropOutcome>;
}

/// Dropper that removes nothing and reports success
///
/// Used by operator tooling that only edits the ledger.
#[derive(Clone, Copy, Debug, Default)]
pub struct LedgerOnlyDropper;

impl PhysicalDropper for LedgerOnlyDropper {
    fn drop_object(&self, request: &DropRequest) -> Result<DropOutcome> {
        tracing::debug!("Ledger-only drop of {}", request.name);
        Ok(DropOutcome::default())
    }
}
