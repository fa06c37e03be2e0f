//! fsledger store - durable fixed-width record tables
//!
//! This crate provides the per-kind object store, the ledger WAL shared by
//! every table, the global sequence counters and the duplicate guard.

pub mod arena;
pub mod guard;
pub mod interlock;
pub mod record;
pub mod sequence;
pub mod store;
pub mod types;
pub mod wal;

// Re-exports
pub use interlock::{CheckpointGuard, CommitGuard, CommitInterlock};
pub use record::{FixedReader, FixedWriter, PersistentRecord, RecordHeader};
pub use sequence::GlobalSequenceTable;
pub use store::{
    InitScanSummary, LedgerSharedState, ObjectStore, StoreContext, StoreScan, StoreStats,
    StoreWriter,
};
pub use types::{CheckpointHeader, LedgerWalOp};
pub use wal::{FileWal, FlushMode, Lsn, MemoryWal, WalSink, WalWriter};
