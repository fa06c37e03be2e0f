//! Rebuilding the ledger from the catalog
//!
//! A ledger that was lost or reset can be repopulated from what the catalog
//! says exists: every object is added directly as created. Filespaces are the
//! exception on reset since their locations live only in the ledger; a
//! rebuild adds a filespace only when the snapshot carries its locations.

use crate::directory::{DatabaseDirRecord, FilespaceDirRecord, INVALID_DB_ID, TablespaceDirRecord};
use crate::kind::ObjectKind;
use crate::ledger::Ledger;
use crate::lifecycle::KindLedger;
use crate::relation::RelationFileRecord;
use crate::snapshot::{CatalogRelationNode, CatalogSnapshot, RelationStorage};
use fsledger_common::{
    DEFAULT_TABLESPACE_OID, Error, GLOBAL_TABLESPACE_OID, ItemLocator, MirrorExistenceState,
    Oid, PersistentState, RelFileNode, Result, SYSTEM_FILESPACE_OID,
    StorageManager, TransactionId,
};
use fsledger_store::{FlushMode, PersistentRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Records added by [`Ledger::rebuild_from_catalog`]
#[derive(Clone, Debug, Default, Serialize)]
pub struct RebuildSummary {
    pub filespaces: u64,
    pub tablespaces: u64,
    pub databases: u64,
    pub relations: u64,
    /// Live records left alone because the ledger already had them
    pub existing: u64,
    /// Filespaces the snapshot carries no locations for
    pub skipped_filespaces: Vec<Oid>,
    /// Where each rebuilt relation segment now lives
    pub relation_nodes: Vec<CatalogRelationNode>,
}

/// Records freed by [`Ledger::reset`]
#[derive(Clone, Debug, Default, Serialize)]
pub struct ResetSummary {
    pub relations: u64,
    pub databases: u64,
    pub tablespaces: u64,
}

impl Ledger {
    /// Add a created record for every object `catalog` names
    ///
    /// With `mirrored` the records say the mirror copy exists and is in
    /// sync. Heap relations get segment 0 only; append-only relations get
    /// segment 0 plus each segment the relation nodes list. Objects that
    /// already have a live record are counted as existing. The WAL is
    /// flushed once at the end.
    pub fn rebuild_from_catalog(
        &self,
        catalog: &CatalogSnapshot,
        mirrored: bool,
    ) -> Result<RebuildSummary> {
        let current = catalog.database(catalog.current_database).ok_or_else(|| {
            Error::invalid_argument(format!(
                "current database {} is not in the catalog",
                catalog.current_database
            ))
        })?;
        let mirror = if mirrored {
            MirrorExistenceState::MirrorCreatePending
        } else {
            MirrorExistenceState::NotMirrored
        };
        let owner = TransactionId::INVALID;
        let mut summary = RebuildSummary::default();

        let live = live_keys(self.filespaces());
        for filespace in &catalog.filespaces {
            if filespace.oid == SYSTEM_FILESPACE_OID {
                continue;
            }
            let Some(primary) = filespace.locations.first() else {
                warn!("Filespace {} has no locations, not rebuilt", filespace.oid);
                summary.skipped_filespaces.push(filespace.oid);
                continue;
            };
            let peer = filespace
                .locations
                .get(1)
                .map_or((INVALID_DB_ID, ""), |l| (l.db_id, l.location.as_str()));
            let record = FilespaceDirRecord::create_pending(
                filespace.oid,
                (primary.db_id, &primary.location),
                peer,
                mirror,
                owner,
            )?;
            if add_created(self.filespaces(), &live, record)?.is_some() {
                summary.filespaces += 1;
            } else {
                summary.existing += 1;
            }
        }

        let live = live_keys(self.tablespaces());
        for tablespace in &catalog.tablespaces {
            if matches!(tablespace.oid, DEFAULT_TABLESPACE_OID | GLOBAL_TABLESPACE_OID) {
                continue;
            }
            let record =
                TablespaceDirRecord::create_pending(tablespace.filespace, tablespace.oid, mirror, owner);
            if add_created(self.tablespaces(), &live, record)?.is_some() {
                summary.tablespaces += 1;
            } else {
                summary.existing += 1;
            }
        }

        let relation_tablespace = |tablespace: Oid| {
            if tablespace == 0 {
                current.tablespace
            } else {
                tablespace
            }
        };

        // Each database's default tablespace, plus the current database's
        // tablespaces its relations live in
        let mut database_dirs: BTreeSet<(Oid, Oid)> = catalog
            .databases
            .iter()
            .map(|d| (d.tablespace, d.oid))
            .collect();
        database_dirs.extend(
            catalog
                .relations
                .iter()
                .filter(|r| r.storage.has_files())
                .map(|r| (relation_tablespace(r.tablespace), current.oid)),
        );
        let live = live_keys(self.databases());
        for (tablespace, database) in database_dirs {
            if tablespace == GLOBAL_TABLESPACE_OID {
                continue;
            }
            let record = DatabaseDirRecord::create_pending(tablespace, database, mirror, owner);
            if add_created(self.databases(), &live, record)?.is_some() {
                summary.databases += 1;
            } else {
                summary.existing += 1;
            }
        }

        let live = live_keys(self.relations());
        for relation in catalog.relations.iter().filter(|r| r.storage.has_files()) {
            let tablespace = relation_tablespace(relation.tablespace);
            let database = if tablespace == GLOBAL_TABLESPACE_OID {
                0
            } else {
                current.oid
            };
            let node = RelFileNode::new(tablespace, database, relation.relfilenode);
            let (storage_manager, segments) = match relation.storage {
                RelationStorage::AppendOnly | RelationStorage::AppendOnlyColumn => {
                    let mut segments: BTreeSet<i32> = catalog
                        .relation_nodes
                        .iter()
                        .filter(|n| n.relfilenode == relation.relfilenode)
                        .map(|n| n.segment)
                        .collect();
                    segments.insert(0);
                    (StorageManager::AppendOnly, segments)
                }
                _ => (StorageManager::BufferPool, BTreeSet::from([0])),
            };

            for segment in segments {
                let record =
                    RelationFileRecord::create_pending(node, segment, storage_manager, mirror, owner);
                match add_created(self.relations(), &live, record)? {
                    Some(locator) => {
                        summary.relations += 1;
                        summary.relation_nodes.push(CatalogRelationNode {
                            relfilenode: relation.relfilenode,
                            segment,
                            locator,
                        });
                    }
                    None => summary.existing += 1,
                }
            }
        }

        self.flush_wal()?;
        info!(
            "Rebuilt ledger from the catalog of database {}: {} filespaces, {} tablespaces, \
             {} database directories, {} relation files ({} already present)",
            current.oid,
            summary.filespaces,
            summary.tablespaces,
            summary.databases,
            summary.relations,
            summary.existing
        );
        Ok(summary)
    }

    /// Free every relation, database and tablespace record
    ///
    /// Filespace records stay since the catalog cannot restore their
    /// locations. Meant to be followed by [`Ledger::rebuild_from_catalog`].
    pub fn reset(&self) -> Result<ResetSummary> {
        let _failover = self.replication_exclusive();
        let summary = ResetSummary {
            relations: free_all(self.relations())?,
            databases: free_all(self.databases())?,
            tablespaces: free_all(self.tablespaces())?,
        };
        self.flush_wal()?;
        warn!(
            "Reset the ledger: freed {} relation files, {} database directories, {} tablespaces",
            summary.relations, summary.databases, summary.tablespaces
        );
        Ok(summary)
    }
}

/// Add `record` and move it straight to created
///
/// Returns `None` when `live` already holds its key.
fn add_created<K: ObjectKind>(
    ledger: &KindLedger<K>,
    live: &[K::Key],
    record: K,
) -> Result<Option<ItemLocator>> {
    if live.contains(&record.key()) {
        debug!("{} already has a live record", record.name());
        return Ok(None);
    }
    let name = record.name();
    let (locator, serial) = ledger.add(record, FlushMode::Deferred)?;
    if locator.is_zero() {
        // Bootstrap mode writes nothing
        return Ok(None);
    }
    ledger.transition(
        &name,
        locator,
        serial,
        PersistentState::Created,
        false,
        FlushMode::Deferred,
    )?;
    Ok(Some(locator))
}

fn live_keys<K: ObjectKind>(ledger: &KindLedger<K>) -> Vec<K::Key> {
    ledger.scan().into_iter().map(|(_, record)| record.key()).collect()
}

fn free_all<K: ObjectKind>(ledger: &KindLedger<K>) -> Result<u64> {
    let locators: Vec<ItemLocator> = ledger.scan().into_iter().map(|(loc, _)| loc).collect();
    for &locator in &locators {
        ledger.repair_delete(locator, FlushMode::Deferred)?;
    }
    if !locators.is_empty() {
        info!("Freed {} {} records", locators.len(), K::KIND);
    }
    Ok(locators.len() as u64)
}
