//! In-memory filespace directory cache
//!
//! Rebuilt from the init scan and kept current through the lifecycle
//! observer hooks, so physical drops and mirror lookups can resolve a
//! filespace's locations without scanning the table.

use crate::directory::{FilespaceDirRecord, INVALID_DB_ID};
use crate::lifecycle::RecordObserver;
use fsledger_common::{ItemLocator, MirrorExistenceState, Oid, PersistentState, SerialNumber};
use fsledger_store::PersistentRecord;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Cached view of one live filespace record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilespaceEntry {
    pub locator: ItemLocator,
    pub serial: SerialNumber,
    pub state: PersistentState,
    pub mirror_existence: MirrorExistenceState,
    pub db_id1: i16,
    pub location1: String,
    pub db_id2: i16,
    pub location2: String,
}

impl FilespaceEntry {
    fn from_record(locator: ItemLocator, record: &FilespaceDirRecord) -> Self {
        Self {
            locator,
            serial: record.serial(),
            state: record.state(),
            mirror_existence: record.mirror_existence(),
            db_id1: record.db_id1,
            location1: record.location1.clone(),
            db_id2: record.db_id2,
            location2: record.location2.clone(),
        }
    }

    /// Location held by `db_id`
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

    /// (primary, mirror) locations as seen from `primary_db_id`
    #[must_use]
    pub fn locations_for(&self, primary_db_id: i16) -> (Option<String>, Option<String>) {
        let primary = self.location_of(primary_db_id).map(str::to_string);
        let mirror = self
            .mirror_db_id(primary_db_id)
            .and_then(|id| self.location_of(id))
            .map(str::to_string);
        (primary, mirror)
    }

    fn mirror_db_id(&self, primary_db_id: i16) -> Option<i16> {
        let peer = if self.db_id1 == primary_db_id {
            self.db_id2
        } else if self.db_id2 == primary_db_id {
            self.db_id1
        } else {
            return None;
        };
        (peer != INVALID_DB_ID).then_some(peer)
    }
}

/// Filespace id to cached entry
#[derive(Debug, Default)]
pub struct FilespaceCache {
    entries: RwLock<HashMap<Oid, FilespaceEntry>>,
}

impl FilespaceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, filespace: Oid) -> Option<FilespaceEntry> {
        self.entries.read().get(&filespace).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Mirror db-id paired with `primary_db_id` for `filespace`
    #[must_use]
    pub fn lookup_mirror_db_id(&self, filespace: Oid, primary_db_id: i16) -> Option<i16> {
        self.entries
            .read()
            .get(&filespace)
            .and_then(|entry| entry.mirror_db_id(primary_db_id))
    }

    fn put(&self, locator: ItemLocator, record: &FilespaceDirRecord) {
        self.entries
            .write()
            .insert(record.filespace, FilespaceEntry::from_record(locator, record));
    }
}

impl RecordObserver<FilespaceDirRecord> for FilespaceCache {
    fn on_scan(&self, locator: ItemLocator, record: &FilespaceDirRecord) {
        self.put(locator, record);
    }

    fn on_change(&self, locator: ItemLocator, record: &FilespaceDirRecord) {
        self.put(locator, record);
    }

    fn on_free(&self, locator: ItemLocator, record: &FilespaceDirRecord) {
        let mut entries = self.entries.write();
        // A newer record for the same filespace may already be cached
        if entries
            .get(&record.filespace)
            .is_some_and(|entry| entry.locator == locator)
        {
            entries.remove(&record.filespace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::memory_context;
    use crate::lifecycle::{KindLedger, LifecycleOptions};
    use fsledger_common::TransactionId;
    use fsledger_store::{FlushMode, ObjectStore};
    use std::sync::Arc;

    fn ledger_with_cache() -> (KindLedger<FilespaceDirRecord>, Arc<FilespaceCache>) {
        let cache = Arc::new(FilespaceCache::new());
        let ledger = KindLedger::new(
            ObjectStore::new(memory_context()),
            LifecycleOptions::default(),
        )
        .with_observer(cache.clone());
        ledger.init_scan(false).unwrap();
        (ledger, cache)
    }

    fn filespace(oid: Oid) -> FilespaceDirRecord {
        FilespaceDirRecord::create_pending(
            oid,
            (2, "/primary/fs"),
            (5, "/mirror/fs"),
            MirrorExistenceState::MirrorCreatePending,
            TransactionId::new(40),
        )
        .unwrap()
    }

    #[test]
    fn test_cache_follows_lifecycle() {
        let (ledger, cache) = ledger_with_cache();
        let record = filespace(17001);
        let name = record.name();
        let (loc, serial) = ledger.add(record, FlushMode::Sync).unwrap();

        let entry = cache.get(17001).unwrap();
        assert_eq!(entry.locator, loc);
        assert_eq!(entry.state, PersistentState::CreatePending);
        assert_eq!(cache.lookup_mirror_db_id(17001, 2), Some(5));
        assert_eq!(cache.lookup_mirror_db_id(17001, 5), Some(2));
        assert_eq!(cache.lookup_mirror_db_id(17001, 9), None);

        ledger
            .mark_aborting_create(&name, loc, serial, false, FlushMode::Sync)
            .unwrap();
        assert_eq!(cache.get(17001).unwrap().state, PersistentState::AbortingCreate);

        ledger.mark_dropped(&name, loc, serial, FlushMode::Sync).unwrap();
        assert!(cache.get(17001).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_rebuilt_by_init_scan() {
        let ctx = memory_context();
        let store = ObjectStore::<FilespaceDirRecord>::new(ctx.clone());
        store.init_scan(false, |_, _| {}).unwrap();
        store.add(filespace(17002), FlushMode::Sync).unwrap();
        store.add(filespace(17003), FlushMode::Sync).unwrap();

        // Replay the WAL into a fresh store and attach the cache there
        let replayed = ObjectStore::<FilespaceDirRecord>::new(ctx.clone());
        ctx.wal
            .replay(0, |lsn, op| replayed.apply_replay(lsn, &op))
            .unwrap();
        let cache = Arc::new(FilespaceCache::new());
        let ledger =
            KindLedger::new(replayed, LifecycleOptions::default()).with_observer(cache.clone());
        ledger.init_scan(false).unwrap();

        assert_eq!(cache.len(), 2);
        let (primary, mirror) = cache.get(17003).unwrap().locations_for(2);
        assert_eq!(primary.as_deref(), Some("/primary/fs"));
        assert_eq!(mirror.as_deref(), Some("/mirror/fs"));
    }
}
