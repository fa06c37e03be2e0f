//! Core type definitions for the ledger
//!
//! This module defines identifiers, object names and the two independent
//! state axes (persistent state and mirror existence) tracked per record.

use crate::error::Error;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Catalog object identifier
pub type Oid = u32;

/// Default tablespace, always present and never tracked as a directory
pub const DEFAULT_TABLESPACE_OID: Oid = 1663;

/// Shared (global) tablespace
pub const GLOBAL_TABLESPACE_OID: Oid = 1664;

/// Built-in system filespace
pub const SYSTEM_FILESPACE_OID: Oid = 3052;

/// Monotonic identifier distinguishing successive uses of the same logical key
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
pub struct SerialNumber(u64);

impl SerialNumber {
    /// Placeholder value carried by freed slots
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The serial number following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifier of the transaction that owns a pending record
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
pub struct TransactionId(u32);

impl TransactionId {
    /// No owning transaction
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Stable address of a record inside one kind's table
///
/// A locator is a slot index plus the generation the slot had when the
/// record was written. Generations start at 1, so `(0, 0)` never names a
/// live record and serves as the zero sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemLocator {
    pub index: u32,
    pub generation: u32,
}

impl ItemLocator {
    /// The well-known zero sentinel
    pub const ZERO: Self = Self {
        index: 0,
        generation: 0,
    };

    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.index == 0 && self.generation == 0
    }
}

impl fmt::Display for ItemLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.index, self.generation)
    }
}

impl FromStr for ItemLocator {
    type Err = Error;

    /// Accepts `index.generation` or `(index,generation)`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let (index, generation) = trimmed
            .split_once(['.', ','])
            .ok_or_else(|| Error::invalid_argument(format!("malformed locator: {s}")))?;
        let index = index
            .trim()
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed locator index: {s}")))?;
        let generation = generation
            .trim()
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed locator generation: {s}")))?;
        Ok(Self { index, generation })
    }
}

/// Lifecycle state of a physical object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PersistentState {
    Free = 0,
    CreatePending = 1,
    Created = 2,
    DropPending = 3,
    AbortingCreate = 4,
    JustInTimeCreatePending = 5,
    BulkLoadCreatePending = 6,
}

impl PersistentState {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Free,
            1 => Self::CreatePending,
            2 => Self::Created,
            3 => Self::DropPending,
            4 => Self::AbortingCreate,
            5 => Self::JustInTimeCreatePending,
            6 => Self::BulkLoadCreatePending,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::CreatePending => "Create Pending",
            Self::Created => "Created",
            Self::DropPending => "Drop Pending",
            Self::AbortingCreate => "Aborting Create",
            Self::JustInTimeCreatePending => "Just-In-Time Create Pending",
            Self::BulkLoadCreatePending => "Bulk Load Create Pending",
        }
    }

    /// True for every state other than `Free`
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Free)
    }

    /// True for the states a create passes through before it commits
    #[must_use]
    pub const fn is_create_pending(self) -> bool {
        matches!(
            self,
            Self::CreatePending | Self::JustInTimeCreatePending | Self::BulkLoadCreatePending
        )
    }
}

impl fmt::Display for PersistentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replica existence state tracked alongside the persistent state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MirrorExistenceState {
    None = 0,
    NotMirrored = 1,
    MirrorCreatePending = 2,
    MirrorCreated = 3,
    MirrorDownBeforeCreate = 4,
    MirrorDownDuringCreate = 5,
    MirrorDropPending = 6,
    OnlyMirrorDropRemains = 7,
}

impl MirrorExistenceState {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::NotMirrored,
            2 => Self::MirrorCreatePending,
            3 => Self::MirrorCreated,
            4 => Self::MirrorDownBeforeCreate,
            5 => Self::MirrorDownDuringCreate,
            6 => Self::MirrorDropPending,
            7 => Self::OnlyMirrorDropRemains,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::NotMirrored => "Not Mirrored",
            Self::MirrorCreatePending => "Mirror Create Pending",
            Self::MirrorCreated => "Mirror Created",
            Self::MirrorDownBeforeCreate => "Mirror Down Before Create",
            Self::MirrorDownDuringCreate => "Mirror Down During Create",
            Self::MirrorDropPending => "Mirror Drop Pending",
            Self::OnlyMirrorDropRemains => "Only Mirror Drop Remains",
        }
    }
}

impl fmt::Display for MirrorExistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How far a relation file's mirror copy is from the primary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MirrorDataSyncState {
    #[default]
    None = 0,
    DataSynchronized = 1,
    FullCopy = 2,
    BufferPoolScanIncremental = 3,
    BufferPoolPageIncremental = 4,
    AppendOnlyCatchup = 5,
}

impl MirrorDataSyncState {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::DataSynchronized,
            2 => Self::FullCopy,
            3 => Self::BufferPoolScanIncremental,
            4 => Self::BufferPoolPageIncremental,
            5 => Self::AppendOnlyCatchup,
            _ => return None,
        })
    }
}

impl fmt::Display for MirrorDataSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::DataSynchronized => "Data Synchronized",
            Self::FullCopy => "Full Copy",
            Self::BufferPoolScanIncremental => "Buffer Pool Scan Incremental",
            Self::BufferPoolPageIncremental => "Buffer Pool Page Incremental",
            Self::AppendOnlyCatchup => "Append-Only Catch-Up",
        };
        f.write_str(name)
    }
}

/// Storage manager owning a relation file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StorageManager {
    #[default]
    BufferPool = 1,
    AppendOnly = 2,
}

impl StorageManager {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::BufferPool),
            2 => Some(Self::AppendOnly),
            _ => None,
        }
    }
}

impl fmt::Display for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferPool => f.write_str("Buffer Pool"),
            Self::AppendOnly => f.write_str("Append-Only"),
        }
    }
}

/// Discriminant of the four ledger tables
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKindTag {
    RelationFile = 1,
    DatabaseDir = 2,
    TablespaceDir = 3,
    FilespaceDir = 4,
}

impl ObjectKindTag {
    pub const ALL: [Self; 4] = [
        Self::RelationFile,
        Self::DatabaseDir,
        Self::TablespaceDir,
        Self::FilespaceDir,
    ];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RelationFile),
            2 => Some(Self::DatabaseDir),
            3 => Some(Self::TablespaceDir),
            4 => Some(Self::FilespaceDir),
            _ => None,
        }
    }

    /// Dense index in `0..4`
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    /// Short name used for file names and the CLI
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RelationFile => "relation",
            Self::DatabaseDir => "database",
            Self::TablespaceDir => "tablespace",
            Self::FilespaceDir => "filespace",
        }
    }
}

impl fmt::Display for ObjectKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKindTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relation" | "relation-file" | "rel" => Ok(Self::RelationFile),
            "database" | "database-dir" | "db" => Ok(Self::DatabaseDir),
            "tablespace" | "tablespace-dir" => Ok(Self::TablespaceDir),
            "filespace" | "filespace-dir" => Ok(Self::FilespaceDir),
            other => Err(Error::invalid_argument(format!("unknown object kind: {other}"))),
        }
    }
}

/// Tablespace, database and relation component of a relation file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelFileNode {
    pub tablespace: Oid,
    pub database: Oid,
    pub relation: Oid,
}

impl RelFileNode {
    #[must_use]
    pub const fn new(tablespace: Oid, database: Oid, relation: Oid) -> Self {
        Self {
            tablespace,
            database,
            relation,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tablespace == 0 && self.database == 0 && self.relation == 0
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tablespace, self.database, self.relation)
    }
}

/// Logical name of a physical object, one variant per kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectName {
    RelationFile { node: RelFileNode, segment: i32 },
    DatabaseDir { tablespace: Oid, database: Oid },
    TablespaceDir { filespace: Oid, tablespace: Oid },
    FilespaceDir { filespace: Oid },
}

impl ObjectName {
    #[must_use]
    pub const fn kind(&self) -> ObjectKindTag {
        match self {
            Self::RelationFile { .. } => ObjectKindTag::RelationFile,
            Self::DatabaseDir { .. } => ObjectKindTag::DatabaseDir,
            Self::TablespaceDir { .. } => ObjectKindTag::TablespaceDir,
            Self::FilespaceDir { .. } => ObjectKindTag::FilespaceDir,
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelationFile { node, segment } => {
                write!(f, "relation {node}, segment file #{segment}")
            }
            Self::DatabaseDir {
                tablespace,
                database,
            } => write!(f, "database directory {tablespace}/{database}"),
            Self::TablespaceDir {
                filespace,
                tablespace,
            } => write!(f, "tablespace directory {tablespace} (filespace {filespace})"),
            Self::FilespaceDir { filespace } => write!(f, "filespace directory {filespace}"),
        }
    }
}
