//! Inputs of the consistency checker
//!
//! The checker never queries the catalog or walks the data directory
//! itself; it compares the ledger against these snapshots.

use fsledger_common::{DEFAULT_TABLESPACE_OID, Error, ItemLocator, Oid, RelFileNode, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFilespace {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    /// Primary first, then mirror; only needed to rebuild the ledger
    #[serde(default)]
    pub locations: Vec<CatalogFilespaceLocation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFilespaceLocation {
    pub db_id: i16,
    pub location: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTablespace {
    pub oid: Oid,
    #[serde(default)]
    pub name: String,
    pub filespace: Oid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDatabase {
    pub oid: Oid,
    pub name: String,
    /// Default tablespace of the database
    #[serde(default = "default_tablespace")]
    pub tablespace: Oid,
}

const fn default_tablespace() -> Oid {
    DEFAULT_TABLESPACE_OID
}

/// Storage class of a catalog relation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationStorage {
    Heap,
    #[serde(rename = "ao")]
    AppendOnly,
    #[serde(rename = "co")]
    AppendOnlyColumn,
    Virtual,
    External,
    Foreign,
}

impl RelationStorage {
    /// Whether relations of this class own segment files
    #[must_use]
    pub const fn has_files(self) -> bool {
        !matches!(self, Self::Virtual | Self::External | Self::Foreign)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRelation {
    pub relfilenode: Oid,
    #[serde(default)]
    pub name: String,
    pub storage: RelationStorage,
    /// 0 means the default tablespace of the current database
    #[serde(default)]
    pub tablespace: Oid,
}

/// Catalog entry pointing a relation segment at its ledger record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRelationNode {
    pub relfilenode: Oid,
    pub segment: i32,
    pub locator: ItemLocator,
}

/// The catalog tables the checker compares the ledger against
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub filespaces: Vec<CatalogFilespace>,
    #[serde(default)]
    pub tablespaces: Vec<CatalogTablespace>,
    #[serde(default)]
    pub databases: Vec<CatalogDatabase>,
    /// Relations of the current database
    #[serde(default)]
    pub relations: Vec<CatalogRelation>,
    #[serde(default)]
    pub relation_nodes: Vec<CatalogRelationNode>,
    pub current_database: Oid,
}

impl CatalogSnapshot {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    #[must_use]
    pub fn relation(&self, relfilenode: Oid) -> Option<&CatalogRelation> {
        self.relations.iter().find(|r| r.relfilenode == relfilenode)
    }

    #[must_use]
    pub fn database(&self, oid: Oid) -> Option<&CatalogDatabase> {
        self.databases.iter().find(|d| d.oid == oid)
    }

    #[must_use]
    pub fn has_database(&self, oid: Oid) -> bool {
        self.databases.iter().any(|d| d.oid == oid)
    }

    #[must_use]
    pub fn has_tablespace(&self, oid: Oid) -> bool {
        self.tablespaces.iter().any(|t| t.oid == oid)
    }

    #[must_use]
    pub fn has_filespace(&self, oid: Oid) -> bool {
        self.filespaces.iter().any(|f| f.oid == oid)
    }
}

/// Database directories and relation segment files found on disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSystemSnapshot {
    /// (tablespace, database)
    pub database_dirs: BTreeSet<(Oid, Oid)>,
    pub relation_files: BTreeSet<(RelFileNode, i32)>,
}

impl FileSystemSnapshot {
    /// Walk `<root>/<tablespace>/<database>/<relfilenode>[.<segment>]`
    ///
    /// Entries whose names are not numeric are ignored.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let mut snapshot = Self::default();
        for tablespace in numeric_entries(root.as_ref())? {
            let (tablespace_oid, tablespace_path) = tablespace;
            for (database_oid, database_path) in numeric_entries(&tablespace_path)? {
                if !database_path.is_dir() {
                    continue;
                }
                snapshot.database_dirs.insert((tablespace_oid, database_oid));

                for entry in std::fs::read_dir(&database_path)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let file_name = entry.file_name();
                    let Some((relation, segment)) = file_name.to_str().and_then(parse_segment_file)
                    else {
                        continue;
                    };
                    snapshot.relation_files.insert((
                        RelFileNode::new(tablespace_oid, database_oid, relation),
                        segment,
                    ));
                }
            }
        }
        debug!(
            "Scanned {} database directories and {} relation files",
            snapshot.database_dirs.len(),
            snapshot.relation_files.len()
        );
        Ok(snapshot)
    }

    #[must_use]
    pub fn contains_relation(&self, node: RelFileNode, segment: i32) -> bool {
        self.relation_files.contains(&(node, segment))
    }
}

fn numeric_entries(dir: &Path) -> Result<Vec<(Oid, std::path::PathBuf)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(oid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            entries.push((oid, entry.path()));
        }
    }
    Ok(entries)
}

/// `16385` is segment 0, `16385.2` is segment 2
fn parse_segment_file(name: &str) -> Option<(Oid, i32)> {
    match name.split_once('.') {
        Some((relation, segment)) => Some((relation.parse().ok()?, segment.parse().ok()?)),
        None => Some((name.parse().ok()?, 0)),
    }
}

/// Replication state of the segment pair
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    InSync,
    NotInSync,
}
