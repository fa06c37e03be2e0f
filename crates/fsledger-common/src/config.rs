//! Configuration types for the ledger
//!
//! Every field has a default so a partial TOML file (or none at all) is
//! a valid configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root ledger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Directory holding the ledger WAL and checkpoint files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub mode: LedgerMode,
    #[serde(default)]
    pub state_change: StateChangeConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wal: WalConfig::default(),
            mode: LedgerMode::default(),
            state_change: StateChangeConfig::default(),
            recovery: RecoveryConfig::default(),
            mirror: MirrorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Path of the shared ledger WAL
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

/// Ledger WAL configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalConfig {
    /// Sync after every write, regardless of the caller's flush request
    #[serde(default)]
    pub sync_on_write: bool,
    /// WAL size above which a checkpoint is advised
    #[serde(default = "default_wal_max_size")]
    pub max_size_bytes: u64,
    /// Buffer size for writes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: false,
            max_size_bytes: default_wal_max_size(),
            write_buffer_size: default_write_buffer_size(),
        }
    }
}

/// Whether the ledger is live yet
///
/// During `Bootstrap` the catalog the ledger describes is still being
/// built, so lifecycle entry points do nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    Bootstrap,
    #[default]
    Normal,
}

impl LedgerMode {
    #[must_use]
    pub const fn is_bootstrap(self) -> bool {
        matches!(self, Self::Bootstrap)
    }
}

/// State change verification policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateChangeConfig {
    /// Downgrade verification failures to warnings and report `Suppressed`
    #[serde(default)]
    pub suppress_errors: bool,
}

/// Recovery policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Advance a global sequence found behind the highest serial number in use
    #[serde(default)]
    pub repair_global_sequence: bool,
}

/// Mirror handling policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Keep a dropped record as `OnlyMirrorDropRemains` when the mirror drop
    /// was lost, instead of freeing it
    #[serde(default)]
    pub retain_on_data_loss: bool,
    /// db-id of this segment in filespace records; without it the first
    /// location slot is taken as the primary
    #[serde(default)]
    pub local_db_id: Option<i16>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./ledger-data")
}

const fn default_wal_max_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}

const fn default_write_buffer_size() -> usize {
    64 * 1024 // 64KB
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_toml() {
        let config = LedgerConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/fsledger"
            mode = "bootstrap"

            [recovery]
            repair_global_sequence = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fsledger"));
        assert!(config.mode.is_bootstrap());
        assert!(config.recovery.repair_global_sequence);
        assert!(!config.state_change.suppress_errors);
        assert_eq!(config.wal.write_buffer_size, 64 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_toml() {
        let err = LedgerConfig::from_toml_str("mode = \"sideways\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fsledger.toml");
        std::fs::write(&path, "[mirror]\nretain_on_data_loss = true\nlocal_db_id = 3\n").unwrap();

        let config = LedgerConfig::load(&path).unwrap();
        assert!(config.mirror.retain_on_data_loss);
        assert_eq!(config.mirror.local_db_id, Some(3));
        assert_eq!(config.mode, LedgerMode::Normal);
        assert!(LedgerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
