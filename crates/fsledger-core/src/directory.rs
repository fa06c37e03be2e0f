//! Directory records: database, tablespace and filespace directories

use crate::kind::{ObjectKind, common_predecessors};
use fsledger_common::{
    Error, MirrorExistenceState, ObjectKindTag, ObjectName, Oid, PersistentState, Result,
    TransactionId,
};
use fsledger_store::{FixedReader, FixedWriter, PersistentRecord, RecordHeader};

/// Width of a filespace location slot; shorter paths are blank padded
pub const FILESPACE_LOCATION_LEN: usize = 256;

/// db-id of an unused filespace slot
pub const INVALID_DB_ID: i16 = 0;

const DB_TO_CREATED: &[PersistentState] = &[
    PersistentState::CreatePending,
    PersistentState::JustInTimeCreatePending,
];
const DB_TO_FREE: &[PersistentState] = &[
    PersistentState::DropPending,
    PersistentState::AbortingCreate,
    PersistentState::JustInTimeCreatePending,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseDirRecord {
    pub header: RecordHeader,
    pub tablespace: Oid,
    pub database: Oid,
}

impl DatabaseDirRecord {
    #[must_use]
    pub fn new(
        tablespace: Oid,
        database: Oid,
        state: PersistentState,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self {
            header: RecordHeader::new(state, mirror, owner),
            tablespace,
            database,
        }
    }

    #[must_use]
    pub fn create_pending(
        tablespace: Oid,
        database: Oid,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self::new(tablespace, database, PersistentState::CreatePending, mirror, owner)
    }

    /// A directory created on first use rather than by DDL
    #[must_use]
    pub fn just_in_time(
        tablespace: Oid,
        database: Oid,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self::new(
            tablespace,
            database,
            PersistentState::JustInTimeCreatePending,
            mirror,
            owner,
        )
    }
}

impl PersistentRecord for DatabaseDirRecord {
    const KIND: ObjectKindTag = ObjectKindTag::DatabaseDir;
    const ENCODED_LEN: usize = RecordHeader::ENCODED_LEN + 16;
    type Key = (Oid, Oid);

    fn key(&self) -> Self::Key {
        (self.tablespace, self.database)
    }

    fn name(&self) -> ObjectName {
        ObjectName::DatabaseDir {
            tablespace: self.tablespace,
            database: self.database,
        }
    }

    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    fn encode_body(&self, w: &mut FixedWriter) {
        w.put_u32(self.tablespace);
        w.put_u32(self.database);
    }

    fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self> {
        Ok(Self {
            header,
            tablespace: r.get_u32()?,
            database: r.get_u32()?,
        })
    }
}

impl ObjectKind for DatabaseDirRecord {
    fn legal_predecessors(next: PersistentState) -> &'static [PersistentState] {
        match next {
            PersistentState::Created => DB_TO_CREATED,
            PersistentState::Free => DB_TO_FREE,
            other => common_predecessors(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablespaceDirRecord {
    pub header: RecordHeader,
    pub filespace: Oid,
    pub tablespace: Oid,
}

impl TablespaceDirRecord {
    #[must_use]
    pub fn new(
        filespace: Oid,
        tablespace: Oid,
        state: PersistentState,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self {
            header: RecordHeader::new(state, mirror, owner),
            filespace,
            tablespace,
        }
    }

    #[must_use]
    pub fn create_pending(
        filespace: Oid,
        tablespace: Oid,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self::new(filespace, tablespace, PersistentState::CreatePending, mirror, owner)
    }
}

impl PersistentRecord for TablespaceDirRecord {
    const KIND: ObjectKindTag = ObjectKindTag::TablespaceDir;
    const ENCODED_LEN: usize = RecordHeader::ENCODED_LEN + 16;
    type Key = (Oid, Oid);

    fn key(&self) -> Self::Key {
        (self.filespace, self.tablespace)
    }

    fn name(&self) -> ObjectName {
        ObjectName::TablespaceDir {
            filespace: self.filespace,
            tablespace: self.tablespace,
        }
    }

    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    fn encode_body(&self, w: &mut FixedWriter) {
        w.put_u32(self.filespace);
        w.put_u32(self.tablespace);
    }

    fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self> {
        Ok(Self {
            header,
            filespace: r.get_u32()?,
            tablespace: r.get_u32()?,
        })
    }
}

impl ObjectKind for TablespaceDirRecord {}

/// Filespace directory with the locations of both halves of a segment pair
///
/// Slot 1 and slot 2 are not tied to a role: either may hold the primary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilespaceDirRecord {
    pub header: RecordHeader,
    pub filespace: Oid,
    pub db_id1: i16,
    pub location1: String,
    pub db_id2: i16,
    pub location2: String,
}

impl FilespaceDirRecord {
    /// Build a record; locations longer than [`FILESPACE_LOCATION_LEN`] are rejected
    pub fn new(
        filespace: Oid,
        (db_id1, location1): (i16, &str),
        (db_id2, location2): (i16, &str),
        state: PersistentState,
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Result<Self> {
        check_location(location1)?;
        check_location(location2)?;
        Ok(Self {
            header: RecordHeader::new(state, mirror, owner),
            filespace,
            db_id1,
            location1: location1.to_string(),
            db_id2,
            location2: location2.to_string(),
        })
    }

    pub fn create_pending(
        filespace: Oid,
        primary: (i16, &str),
        mirror_slot: (i16, &str),
        mirror: MirrorExistenceState,
        owner: TransactionId,
    ) -> Result<Self> {
        Self::new(
            filespace,
            primary,
            mirror_slot,
            PersistentState::CreatePending,
            mirror,
            owner,
        )
    }

    /// Location held by `db_id`, if either slot belongs to it
    #[must_use]
    pub fn location_of(&self, db_id: i16) -> Option<&str> {
        if db_id == INVALID_DB_ID {
            None
        } else if self.db_id1 == db_id {
            Some(&self.location1)
        } else if self.db_id2 == db_id {
            Some(&self.location2)
        } else {
            None
        }
    }

    /// The db-id paired with `db_id`, if any
    #[must_use]
    pub fn peer_of(&self, db_id: i16) -> Option<i16> {
        let peer = if self.db_id1 == db_id {
            self.db_id2
        } else if self.db_id2 == db_id {
            self.db_id1
        } else {
            return None;
        };
        (peer != INVALID_DB_ID).then_some(peer)
    }
}

fn check_location(location: &str) -> Result<()> {
    if location.len() > FILESPACE_LOCATION_LEN {
        return Err(Error::invalid_argument(format!(
            "filespace location is {} bytes, limit is {FILESPACE_LOCATION_LEN}",
            location.len()
        )));
    }
    Ok(())
}

fn put_location(w: &mut FixedWriter, location: &str) {
    let mut slot = [b' '; FILESPACE_LOCATION_LEN];
    let bytes = location.as_bytes();
    let len = bytes.len().min(FILESPACE_LOCATION_LEN);
    slot[..len].copy_from_slice(&bytes[..len]);
    w.put_bytes(&slot);
}

fn get_location(r: &mut FixedReader<'_>) -> Result<String> {
    let slot = r.get_array::<FILESPACE_LOCATION_LEN>()?;
    let trimmed = slot
        .iter()
        .rposition(|b| *b != b' ')
        .map_or(&slot[..0], |end| &slot[..=end]);
    String::from_utf8(trimmed.to_vec())
        .map_err(|e| Error::corruption(format!("filespace location is not UTF-8: {e}")))
}

impl PersistentRecord for FilespaceDirRecord {
    const KIND: ObjectKindTag = ObjectKindTag::FilespaceDir;
    const ENCODED_LEN: usize = RecordHeader::ENCODED_LEN + 8 + 2 * FILESPACE_LOCATION_LEN;
    type Key = Oid;

    fn key(&self) -> Oid {
        self.filespace
    }

    fn name(&self) -> ObjectName {
        ObjectName::FilespaceDir {
            filespace: self.filespace,
        }
    }

    fn header(&self) -> &RecordHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    fn encode_body(&self, w: &mut FixedWriter) {
        w.put_u32(self.filespace);
        w.put_i16(self.db_id1);
        w.put_i16(self.db_id2);
        put_location(w, &self.location1);
        put_location(w, &self.location2);
    }

    fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self> {
        let filespace = r.get_u32()?;
        let db_id1 = r.get_i16()?;
        let db_id2 = r.get_i16()?;
        Ok(Self {
            header,
            filespace,
            db_id1,
            location1: get_location(r)?,
            db_id2,
            location2: get_location(r)?,
        })
    }
}

impl ObjectKind for FilespaceDirRecord {
    fn remove_segment_fields(&mut self, db_id: i16) {
        if self.db_id1 == db_id {
            self.db_id1 = INVALID_DB_ID;
            self.location1.clear();
        } else {
            self.db_id2 = INVALID_DB_ID;
            self.location2.clear();
        }
    }

    fn activate_standby_fields(&mut self, old_master: i16, new_master: i16) -> Result<()> {
        // The standby's location moves into the new master's slot
        if self.db_id1 == old_master {
            self.location2 = std::mem::take(&mut self.location1);
            self.db_id1 = INVALID_DB_ID;
            self.db_id2 = new_master;
        } else if self.db_id2 == old_master {
            self.location1 = std::mem::take(&mut self.location2);
            self.db_id2 = INVALID_DB_ID;
            self.db_id1 = new_master;
        } else {
            return Err(Error::invalid_argument(format!(
                "{} has no location for db-id {old_master}",
                self.name()
            )));
        }
        Ok(())
    }

    fn add_mirror_fields(
        &mut self,
        primary_db_id: i16,
        mirror_db_id: i16,
        mirror_location: &str,
    ) -> Result<bool> {
        check_location(mirror_location)?;
        if self.db_id1 == primary_db_id {
            self.db_id2 = mirror_db_id;
            self.location2 = mirror_location.to_string();
        } else {
            self.db_id1 = mirror_db_id;
            self.location1 = mirror_location.to_string();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsledger_common::SerialNumber;

    fn filespace() -> FilespaceDirRecord {
        FilespaceDirRecord::create_pending(
            17000,
            (2, "/data/primary/fs1"),
            (5, "/data/mirror/fs1"),
            MirrorExistenceState::MirrorCreatePending,
            TransactionId::new(44),
        )
        .unwrap()
    }

    #[test]
    fn test_filespace_locations_blank_padded() {
        let mut record = filespace();
        record.header.serial = SerialNumber::new(3);

        let image = record.encode();
        assert_eq!(image.len(), FilespaceDirRecord::ENCODED_LEN);
        let start = RecordHeader::ENCODED_LEN + 8;
        assert_eq!(image[start + FILESPACE_LOCATION_LEN - 1], b' ');
        assert_eq!(FilespaceDirRecord::decode(&image).unwrap(), record);
    }

    #[test]
    fn test_filespace_location_limit() {
        let long = "x".repeat(FILESPACE_LOCATION_LEN + 1);
        let err = FilespaceDirRecord::create_pending(
            1,
            (1, &long),
            (0, ""),
            MirrorExistenceState::NotMirrored,
            TransactionId::INVALID,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_filespace_segment_edits() {
        let mut record = filespace();
        assert_eq!(record.location_of(5), Some("/data/mirror/fs1"));
        assert_eq!(record.peer_of(2), Some(5));

        record.remove_segment_fields(5);
        assert_eq!(record.db_id2, INVALID_DB_ID);
        assert_eq!(record.location_of(5), None);
        assert_eq!(record.peer_of(2), None);

        assert!(record.add_mirror_fields(2, 9, "/data/new-mirror").unwrap());
        assert_eq!(record.location_of(9), Some("/data/new-mirror"));

        record.activate_standby_fields(2, 9).unwrap();
        assert_eq!((record.db_id1, record.db_id2), (INVALID_DB_ID, 9));
        assert_eq!(record.location_of(9), Some("/data/primary/fs1"));
        assert!(record.activate_standby_fields(7, 8).is_err());
    }

    #[test]
    fn test_database_predecessors() {
        use PersistentState as S;

        assert_eq!(
            DatabaseDirRecord::legal_predecessors(S::Free),
            &[S::DropPending, S::AbortingCreate, S::JustInTimeCreatePending]
        );
        assert!(DatabaseDirRecord::legal_predecessors(S::CreatePending).is_empty());
        assert_eq!(
            TablespaceDirRecord::legal_predecessors(S::Created),
            &[S::CreatePending]
        );
    }

    #[test]
    fn test_directory_images() {
        let mut db = DatabaseDirRecord::just_in_time(
            1663,
            16384,
            MirrorExistenceState::MirrorCreated,
            TransactionId::new(2),
        );
        db.header.serial = SerialNumber::new(1);
        assert_eq!(DatabaseDirRecord::decode(&db.encode()).unwrap(), db);

        let ts = TablespaceDirRecord::create_pending(
            17000,
            17001,
            MirrorExistenceState::NotMirrored,
            TransactionId::new(2),
        );
        assert_eq!(ts.key(), (17000, 17001));
        assert_eq!(TablespaceDirRecord::decode(&ts.encode()).unwrap(), ts);
    }
}
