//! fsledger core - lifecycle of persistent filesystem objects
//!
//! This crate layers the per-kind state machines over the object store,
//! adds the field-level edits used by mirror failover, drives two-phase
//! resolution of pending creates and drops, checks the ledger against the
//! catalog and the filesystem, and rebuilds it from the catalog.

pub mod build;
pub mod cache;
pub mod check;
pub mod directory;
pub mod edits;
pub mod kind;
pub mod ledger;
pub mod lifecycle;
pub mod mirror;
pub mod physical;
pub mod relation;
pub mod resolve;
pub mod snapshot;

// Re-exports
pub use build::{RebuildSummary, ResetSummary};
pub use cache::{FilespaceCache, FilespaceEntry};
pub use check::{CheckReport, CheckResult, CheckerOptions, ConsistencyChecker};
pub use directory::{DatabaseDirRecord, FilespaceDirRecord, TablespaceDirRecord};
pub use edits::{BufferPoolResyncMarkers, SegmentRemoval};
pub use kind::ObjectKind;
pub use ledger::{DropTarget, IntegrityReport, KindCounts, Ledger, LedgerRow, RecoverySummary};
pub use lifecycle::{KindLedger, LifecycleOptions, RecordObserver, StateChangeResult};
pub use physical::{DropOutcome, DropRequest, LedgerOnlyDropper, PhysicalDropper};
pub use relation::RelationFileRecord;
pub use resolve::{
    ActionKind, ActionOutcome, PendingAction, PendingEofMarker, ResolutionBatch,
    ResolutionDriver, ResolutionReport,
};
pub use snapshot::{CatalogSnapshot, FileSystemSnapshot, RelationStorage, SyncState};
