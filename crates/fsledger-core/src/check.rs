//! Consistency Checker
//!
//! A fixed battery of named checks comparing the ledger against itself,
//! the global sequences, a catalog snapshot and a filesystem snapshot.
//! Each check collects its violating rows. State checks only run while the
//! segment pair is in sync; the rest always run, and the filesystem checks
//! run whenever a filesystem snapshot is supplied.

use crate::kind::ObjectKind;
use crate::ledger::Ledger;
use crate::lifecycle::KindLedger;
use crate::relation::RelationFileRecord;
use crate::snapshot::{CatalogSnapshot, FileSystemSnapshot, RelationStorage, SyncState};
use fsledger_common::{
    DEFAULT_TABLESPACE_OID, Error, GLOBAL_TABLESPACE_OID, MirrorExistenceState, Oid,
    PersistentState, Result, SYSTEM_FILESPACE_OID, StorageManager,
};
use fsledger_store::PersistentRecord;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Checker tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckerOptions {
    /// A catalog database with fewer created relation files is reported
    pub min_database_relations: usize,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            min_database_relations: 100,
        }
    }
}

/// Violations found by one named check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub violations: Vec<String>,
}

impl CheckResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Results of every check that ran
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    /// Total violating rows
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.iter().map(|r| r.violations.len()).sum()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed())
    }

    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::ConsistencyViolation {
                failed_checks: self.failed().count(),
                violations: self.total(),
            })
        }
    }
}

/// Runs the check battery against one catalog snapshot
pub struct ConsistencyChecker<'a> {
    ledger: &'a Ledger,
    catalog: &'a CatalogSnapshot,
    filesystem: Option<&'a FileSystemSnapshot>,
    options: CheckerOptions,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(ledger: &'a Ledger, catalog: &'a CatalogSnapshot) -> Self {
        Self {
            ledger,
            catalog,
            filesystem: None,
            options: CheckerOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_filesystem(mut self, filesystem: &'a FileSystemSnapshot) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    #[must_use]
    pub const fn with_options(mut self, options: CheckerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn run(&self, sync: SyncState) -> CheckReport {
        let in_sync = sync == SyncState::InSync;
        let mut report = CheckReport::default();
        let mut push = |name: &'static str, violations: Vec<String>| {
            if !violations.is_empty() {
                warn!("Check '{}' found {} violations", name, violations.len());
                for violation in &violations {
                    warn!("  {}: {}", name, violation);
                }
            }
            report.results.push(CheckResult { name, violations });
        };

        let ledger = self.ledger;
        if in_sync {
            push("filespace state", state_violations(ledger.filespaces(), |_| true));
        }
        push("filespace <=> catalog", self.filespaces_vs_catalog());
        push("filespace <=> sequence", self.sequence_violations(ledger.filespaces()));

        if in_sync {
            push("database state", state_violations(ledger.databases(), |_| true));
        }
        push("database <=> catalog", self.databases_vs_catalog());
        push("database <=> catalog tablespace", self.databases_vs_tablespaces());
        push("database <=> sequence", self.sequence_violations(ledger.databases()));

        if in_sync {
            push("tablespace state", state_violations(ledger.tablespaces(), |_| true));
        }
        push("tablespace <=> catalog", self.tablespaces_vs_catalog());
        push("tablespace <=> catalog filespace", self.tablespaces_vs_filespaces());
        push("tablespace <=> sequence", self.sequence_violations(ledger.tablespaces()));

        push("relation <=> catalog database", self.relations_vs_databases());
        push("relation <=> sequence", self.sequence_violations(ledger.relations()));

        if let Some(fs) = self.filesystem {
            push("catalog database <=> filesystem", self.databases_vs_filesystem(fs));
        }

        // Checks scoped to the current database
        let current = self.catalog.current_database;
        if in_sync {
            push(
                "relation state",
                state_violations(ledger.relations(), |r| r.node.database == current),
            );
        }
        push("relation <=> catalog tablespace", self.relations_vs_tablespaces());
        push("relation <=> relation node", self.relations_vs_nodes());
        push("relation <=> catalog relation", self.relations_vs_catalog());
        if let Some(fs) = self.filesystem {
            push("relation <=> filesystem", self.relations_vs_filesystem(fs));
        }

        info!(
            "Consistency check ran {} checks: {} violations",
            report.results.len(),
            report.total()
        );
        report
    }

    fn sequence_violations<K: ObjectKind>(&self, kind_ledger: &KindLedger<K>) -> Vec<String> {
        let sequence = self.ledger.sequences().get(K::KIND);
        kind_ledger
            .store()
            .begin_scan()
            .filter(|(_, serial, _)| serial.get() > sequence)
            .map(|(locator, serial, record)| {
                format!(
                    "{} at {} has serial {} beyond the {} sequence {}",
                    record.name(),
                    locator,
                    serial,
                    K::KIND,
                    sequence
                )
            })
            .collect()
    }

    fn filespaces_vs_catalog(&self) -> Vec<String> {
        let ledger: BTreeSet<Oid> = created(self.ledger.filespaces())
            .map(|r| r.filespace)
            .collect();
        let catalog: BTreeSet<Oid> = self
            .catalog
            .filespaces
            .iter()
            .map(|f| f.oid)
            .filter(|&oid| oid != SYSTEM_FILESPACE_OID)
            .collect();
        outer_join("filespace", &ledger, &catalog)
    }

    fn databases_vs_catalog(&self) -> Vec<String> {
        let ledger: BTreeSet<Oid> = created(self.ledger.databases()).map(|r| r.database).collect();
        let catalog: BTreeSet<Oid> = self.catalog.databases.iter().map(|d| d.oid).collect();
        outer_join("database", &ledger, &catalog)
    }

    fn databases_vs_tablespaces(&self) -> Vec<String> {
        created(self.ledger.databases())
            .filter(|r| {
                r.tablespace == GLOBAL_TABLESPACE_OID || !self.catalog.has_tablespace(r.tablespace)
            })
            .map(|r| format!("{} is in tablespace {} missing from the catalog", r.name(), r.tablespace))
            .collect()
    }

    fn tablespaces_vs_catalog(&self) -> Vec<String> {
        let ledger: BTreeSet<Oid> = created(self.ledger.tablespaces())
            .map(|r| r.tablespace)
            .collect();
        let catalog: BTreeSet<Oid> = self
            .catalog
            .tablespaces
            .iter()
            .map(|t| t.oid)
            .filter(|&oid| oid != DEFAULT_TABLESPACE_OID && oid != GLOBAL_TABLESPACE_OID)
            .collect();
        outer_join("tablespace", &ledger, &catalog)
    }

    fn tablespaces_vs_filespaces(&self) -> Vec<String> {
        created(self.ledger.tablespaces())
            .filter(|r| !self.catalog.has_filespace(r.filespace))
            .map(|r| format!("{} is in filespace {} missing from the catalog", r.name(), r.filespace))
            .collect()
    }

    fn relations_vs_databases(&self) -> Vec<String> {
        let mut per_database: BTreeMap<Oid, usize> = BTreeMap::new();
        for record in created(self.ledger.relations()) {
            if record.node.database != 0 {
                *per_database.entry(record.node.database).or_default() += 1;
            }
        }

        let mut violations = Vec::new();
        for (&database, &count) in &per_database {
            if !self.catalog.has_database(database) {
                violations.push(format!(
                    "{count} relation files belong to database {database} missing from the catalog"
                ));
            }
        }
        for database in &self.catalog.databases {
            let count = per_database.get(&database.oid).copied().unwrap_or(0);
            if count < self.options.min_database_relations {
                violations.push(format!(
                    "database {} '{}' has only {} relation files",
                    database.oid, database.name, count
                ));
            }
        }
        violations
    }

    fn databases_vs_filesystem(&self, fs: &FileSystemSnapshot) -> Vec<String> {
        fs.database_dirs
            .iter()
            .filter(|(_, database)| *database != 0 && !self.catalog.has_database(*database))
            .map(|(tablespace, database)| {
                format!("directory {tablespace}/{database} has no catalog database")
            })
            .collect()
    }

    /// Created relation files of the current database and of shared relations
    fn current_relations(&self) -> impl Iterator<Item = RelationFileRecord> + '_ {
        let current = self.catalog.current_database;
        created(self.ledger.relations())
            .filter(move |r| r.node.database == current || r.node.database == 0)
    }

    fn relations_vs_tablespaces(&self) -> Vec<String> {
        let tablespaces: BTreeSet<Oid> = self
            .current_relations()
            .map(|r| r.node.tablespace)
            .collect();
        tablespaces
            .into_iter()
            .filter(|&ts| !self.catalog.has_tablespace(ts))
            .map(|ts| format!("relation files use tablespace {ts} missing from the catalog"))
            .collect()
    }

    fn relations_vs_nodes(&self) -> Vec<String> {
        let current = self.catalog.current_database;
        let mut ledger = BTreeMap::new();
        for (locator, _, record) in self.ledger.relations().store().begin_scan() {
            if record.state() == PersistentState::Created
                && (record.node.database == current || record.node.database == 0)
            {
                ledger.insert((record.node.relation, record.segment), locator);
            }
        }
        let catalog: BTreeMap<_, _> = self
            .catalog
            .relation_nodes
            .iter()
            .map(|n| ((n.relfilenode, n.segment), n.locator))
            .collect();

        let mut violations = Vec::new();
        for (&(relation, segment), &locator) in &ledger {
            match catalog.get(&(relation, segment)) {
                None => violations.push(format!(
                    "relation {relation} segment {segment} at {locator} has no relation node"
                )),
                Some(&expected) if expected != locator => violations.push(format!(
                    "relation {relation} segment {segment} is at {locator}, relation node says {expected}"
                )),
                Some(_) => {}
            }
        }
        for (&(relation, segment), &locator) in &catalog {
            if !ledger.contains_key(&(relation, segment)) {
                violations.push(format!(
                    "relation node {relation} segment {segment} points at {locator} with no created record"
                ));
            }
        }
        violations
    }

    fn relations_vs_catalog(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut seen = BTreeSet::new();
        for record in self.current_relations() {
            seen.insert(record.node.relation);
            if !self
                .catalog
                .relation(record.node.relation)
                .is_some_and(|r| r.storage.has_files())
            {
                violations.push(format!("{} has no catalog relation", record.name()));
            }
        }
        for relation in &self.catalog.relations {
            if relation.storage.has_files() && !seen.contains(&relation.relfilenode) {
                violations.push(format!(
                    "catalog relation {} '{}' has no relation files",
                    relation.relfilenode, relation.name
                ));
            }
        }
        violations
    }

    fn relations_vs_filesystem(&self, fs: &FileSystemSnapshot) -> Vec<String> {
        let current = self.catalog.current_database;
        // Heap relations extend past segment 0 without ledger records
        let ledger: BTreeSet<_> = self
            .current_relations()
            .filter(|r| r.storage_manager != StorageManager::BufferPool || r.segment == 0)
            .map(|r| (r.node, r.segment))
            .collect();

        let mut violations: Vec<String> = ledger
            .iter()
            .filter(|(node, segment)| !fs.contains_relation(*node, *segment))
            .map(|(node, segment)| format!("relation file {node}.{segment} is missing on disk"))
            .collect();

        for (node, segment) in &fs.relation_files {
            if node.database != current && node.database != 0 {
                continue;
            }
            let heap = self
                .catalog
                .relation(node.relation)
                .is_none_or(|r| r.storage == RelationStorage::Heap);
            if *segment > 0 && heap {
                continue;
            }
            if !ledger.contains(&(*node, *segment)) {
                violations.push(format!("file {node}.{segment} on disk has no created record"));
            }
        }
        debug!(
            "Compared {} relation files with {} files on disk",
            ledger.len(),
            fs.relation_files.len()
        );
        violations
    }
}

fn created<K: ObjectKind>(ledger: &KindLedger<K>) -> impl Iterator<Item = K> + '_ {
    ledger
        .store()
        .begin_scan()
        .map(|(_, _, record)| record)
        .filter(|record| record.state() == PersistentState::Created)
}

/// Live records stuck in a transient state or mirror existence
fn state_violations<K: ObjectKind>(
    ledger: &KindLedger<K>,
    filter: impl Fn(&K) -> bool,
) -> Vec<String> {
    ledger
        .store()
        .begin_scan()
        .filter(|(_, _, record)| filter(record))
        .filter(|(_, _, record)| {
            !matches!(record.state(), PersistentState::Free | PersistentState::Created)
                || !matches!(
                    record.mirror_existence(),
                    MirrorExistenceState::None
                        | MirrorExistenceState::NotMirrored
                        | MirrorExistenceState::MirrorCreated
                )
        })
        .map(|(locator, _, record)| {
            format!(
                "{} at {} is '{}' with mirror existence '{}'",
                record.name(),
                locator,
                record.state(),
                record.mirror_existence()
            )
        })
        .collect()
}

fn outer_join(what: &str, ledger: &BTreeSet<Oid>, catalog: &BTreeSet<Oid>) -> Vec<String> {
    let missing_in_catalog = ledger
        .difference(catalog)
        .map(|oid| format!("{what} {oid} is created in the ledger but not in the catalog"));
    let missing_in_ledger = catalog
        .difference(ledger)
        .map(|oid| format!("{what} {oid} is in the catalog but not created in the ledger"));
    missing_in_catalog.chain(missing_in_ledger).collect()
}
