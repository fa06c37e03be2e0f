//! Relation file records
//!
//! One record per segment file of a relation, carrying the mirror resync
//! markers the resync worker reads and writes back.

use crate::kind::{ObjectKind, common_predecessors};
use fsledger_common::{
    Error, MirrorDataSyncState, MirrorExistenceState, ObjectKindTag, ObjectName, PersistentState,
    RelFileNode, Result, StorageManager, TransactionId,
};
use fsledger_store::guard::abort_race_exception;
use fsledger_store::{FixedReader, FixedWriter, PersistentRecord, RecordHeader};

const TO_CREATE_PENDING: &[PersistentState] = &[PersistentState::BulkLoadCreatePending];
const TO_ABORTING_CREATE: &[PersistentState] = &[
    PersistentState::CreatePending,
    PersistentState::BulkLoadCreatePending,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationFileRecord {
    pub header: RecordHeader,
    pub node: RelFileNode,
    pub segment: i32,
    pub storage_manager: StorageManager,
    pub data_sync_state: MirrorDataSyncState,
    /// Buffer-pool relation needs a scan-based incremental resync
    pub bufpool_marked_for_scan: bool,
    pub bufpool_changed_page_count: i64,
    pub bufpool_resync_ckpt_loc: u64,
    pub bufpool_resync_ckpt_block: u32,
    /// Append-only EOF the mirror is known to hold
    pub ao_loss_eof: i64,
    /// Append-only EOF the mirror must catch up to
    pub ao_new_eof: i64,
}

impl RelationFileRecord {
    #[must_use]
    pub fn new(
        node: RelFileNode,
        segment: i32,
        storage_manager: StorageManager,
        state: PersistentState,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self {
            header: RecordHeader::new(state, mirror, owner),
            node,
            segment,
            storage_manager,
            data_sync_state: MirrorDataSyncState::None,
            bufpool_marked_for_scan: false,
            bufpool_changed_page_count: 0,
            bufpool_resync_ckpt_loc: 0,
            bufpool_resync_ckpt_block: 0,
            ao_loss_eof: 0,
            ao_new_eof: 0,
        }
    }

    /// A new segment file about to be created by `owner`
    #[must_use]
    pub fn create_pending(
        node: RelFileNode,
        segment: i32,
        storage_manager: StorageManager,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        let mut record = Self::new(
            node,
            segment,
            storage_manager,
            PersistentState::CreatePending,
            mirror,
            owner,
        );
        if mirror == MirrorExistenceState::MirrorCreatePending {
            record.data_sync_state = MirrorDataSyncState::DataSynchronized;
        }
        record
    }

    /// A segment file written by the bulk-load path
    #[must_use]
    pub fn bulk_load_create_pending(
        node: RelFileNode,
        segment: i32,
        storage_manager: StorageManager,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        let mut record = Self::create_pending(node, segment, storage_manager, mirror, owner);
        record.header.state = PersistentState::BulkLoadCreatePending;
        record
    }
}

impl PersistentRecord for RelationFileRecord {
    const KIND: ObjectKindTag = ObjectKindTag::RelationFile;
    const ENCODED_LEN: usize = RecordHeader::ENCODED_LEN + 64;
    type Key = (RelFileNode, i32);

    fn key(&self) -> Self::Key {
        (self.node, self.segment)
    }

    fn name(&self) -> ObjectName {
        ObjectName::RelationFile {
            node: self.node,
            segment: self.segment,
        }
    }

    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    fn encode_body(&self, w: &mut FixedWriter) {
        w.put_u32(self.node.tablespace);
        w.put_u32(self.node.database);
        w.put_u32(self.node.relation);
        w.put_i32(self.segment);
        w.put_u8(self.storage_manager.as_u8());
        w.put_u8(self.data_sync_state.as_u8());
        w.put_bool(self.bufpool_marked_for_scan);
        w.put_u8(0);
        w.put_u32(self.bufpool_resync_ckpt_block);
        w.put_i64(self.bufpool_changed_page_count);
        w.put_u64(self.bufpool_resync_ckpt_loc);
        w.put_i64(self.ao_loss_eof);
        w.put_i64(self.ao_new_eof);
    }

    fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self> {
        let node = RelFileNode::new(r.get_u32()?, r.get_u32()?, r.get_u32()?);
        let segment = r.get_i32()?;
        let sm = r.get_u8()?;
        let sync = r.get_u8()?;
        let bufpool_marked_for_scan = r.get_bool()?;
        r.skip(1)?;
        let bufpool_resync_ckpt_block = r.get_u32()?;

        Ok(Self {
            header,
            node,
            segment,
            storage_manager: StorageManager::from_u8(sm)
                .ok_or_else(|| Error::corruption(format!("unknown storage manager {sm}")))?,
            data_sync_state: MirrorDataSyncState::from_u8(sync)
                .ok_or_else(|| Error::corruption(format!("unknown data sync state {sync}")))?,
            bufpool_marked_for_scan,
            bufpool_changed_page_count: r.get_i64()?,
            bufpool_resync_ckpt_loc: r.get_u64()?,
            bufpool_resync_ckpt_block,
            ao_loss_eof: r.get_i64()?,
            ao_new_eof: r.get_i64()?,
        })
    }

    fn allows_duplicate_of(&self, existing: &Self) -> bool {
        abort_race_exception(
            existing.state(),
            existing.mirror_existence(),
            self.state(),
            self.mirror_existence(),
        )
    }
}

impl ObjectKind for RelationFileRecord {
    fn legal_predecessors(next: PersistentState) -> &'static [PersistentState] {
        match next {
            PersistentState::CreatePending => TO_CREATE_PENDING,
            PersistentState::AbortingCreate => TO_ABORTING_CREATE,
            other => common_predecessors(other),
        }
    }

    fn apply_state_change(&mut self, next: PersistentState) {
        if matches!(
            next,
            PersistentState::DropPending | PersistentState::AbortingCreate
        ) {
            self.data_sync_state = MirrorDataSyncState::None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsledger_common::SerialNumber;

    fn sample() -> RelationFileRecord {
        let mut record = RelationFileRecord::create_pending(
            RelFileNode::new(1663, 16384, 16385),
            2,
            StorageManager::AppendOnly,
            MirrorExistenceState::MirrorCreatePending,
            TransactionId::new(700),
        );
        record.header.serial = SerialNumber::new(12);
        record.bufpool_resync_ckpt_loc = 0xDEAD_BEEF;
        record.ao_loss_eof = 4096;
        record.ao_new_eof = 8192;
        record
    }

    #[test]
    fn test_image_roundtrip() {
        let record = sample();
        let image = record.encode();
        assert_eq!(image.len(), RelationFileRecord::ENCODED_LEN);
        assert_eq!(RelationFileRecord::decode(&image).unwrap(), record);
    }

    #[test]
    fn test_bad_storage_manager_is_corruption() {
        let mut image = sample().encode();
        // storage manager byte follows header and node/segment
        image[RecordHeader::ENCODED_LEN + 16] = 9;
        assert!(matches!(
            RelationFileRecord::decode(&image),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_predecessors() {
        use PersistentState as S;

        assert_eq!(
            RelationFileRecord::legal_predecessors(S::CreatePending),
            &[S::BulkLoadCreatePending]
        );
        assert_eq!(
            RelationFileRecord::legal_predecessors(S::AbortingCreate),
            &[S::CreatePending, S::BulkLoadCreatePending]
        );
        assert_eq!(
            RelationFileRecord::legal_predecessors(S::Created),
            &[S::CreatePending]
        );
    }

    #[test]
    fn test_drop_resets_sync_state() {
        let mut record = sample();
        assert_eq!(record.data_sync_state, MirrorDataSyncState::DataSynchronized);
        record.apply_state_change(PersistentState::Created);
        assert_eq!(record.data_sync_state, MirrorDataSyncState::DataSynchronized);
        record.apply_state_change(PersistentState::DropPending);
        assert_eq!(record.data_sync_state, MirrorDataSyncState::None);
    }
}
