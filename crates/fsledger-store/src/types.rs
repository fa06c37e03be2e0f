//! WAL operation and checkpoint header types

use fsledger_common::{Error, ItemLocator, ObjectKindTag, Result, SerialNumber};
use serde::{Deserialize, Serialize};

/// Ledger mutation recorded in the WAL
///
/// Images are the fixed-width encoding of the record after the change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerWalOp {
    /// A new record at a fresh locator
    Insert {
        kind: ObjectKindTag,
        locator: ItemLocator,
        serial: SerialNumber,
        image: Vec<u8>,
    },
    /// In-place rewrite of a live record
    Update {
        kind: ObjectKindTag,
        locator: ItemLocator,
        image: Vec<u8>,
    },
    /// Slot returned to the free pool
    Free {
        kind: ObjectKindTag,
        locator: ItemLocator,
    },
}

impl LedgerWalOp {
    #[must_use]
    pub const fn kind(&self) -> ObjectKindTag {
        match self {
            Self::Insert { kind, .. } | Self::Update { kind, .. } | Self::Free { kind, .. } => {
                *kind
            }
        }
    }

    #[must_use]
    pub const fn locator(&self) -> ItemLocator {
        match self {
            Self::Insert { locator, .. }
            | Self::Update { locator, .. }
            | Self::Free { locator, .. } => *locator,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::corruption(format!("undecodable WAL operation: {e}")))
    }
}

/// Header of a per-kind checkpoint file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Magic number for validation
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Table the checkpoint belongs to
    pub kind: ObjectKindTag,
    /// Fixed width of one record image
    pub record_len: u32,
    /// Every WAL record up to this LSN is reflected in the checkpoint
    pub checkpoint_lsn: u64,
    /// Number of slots that follow the header
    pub slot_count: u64,
    /// Global sequence value at checkpoint time
    pub sequence: u64,
    /// CRC32C of the slot data (excluding header)
    pub checksum: u32,
}

impl CheckpointHeader {
    pub const MAGIC: u32 = 0x464C_434B; // "FLCK"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 48;

    pub const fn new(
        kind: ObjectKindTag,
        record_len: u32,
        checkpoint_lsn: u64,
        slot_count: u64,
        sequence: u64,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            kind,
            record_len,
            checkpoint_lsn,
            slot_count,
            sequence,
            checksum: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8] = self.kind.as_u8();
        buf[12..16].copy_from_slice(&self.record_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checkpoint_lsn.to_le_bytes());
        buf[24..32].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.sequence.to_le_bytes());
        buf[40..44].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        if magic != Self::MAGIC {
            return None;
        }
        Some(Self {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into().ok()?),
            kind: ObjectKindTag::from_u8(data[8])?,
            record_len: u32::from_le_bytes(data[12..16].try_into().ok()?),
            checkpoint_lsn: u64::from_le_bytes(data[16..24].try_into().ok()?),
            slot_count: u64::from_le_bytes(data[24..32].try_into().ok()?),
            sequence: u64::from_le_bytes(data[32..40].try_into().ok()?),
            checksum: u32::from_le_bytes(data[40..44].try_into().ok()?),
        })
    }
}
