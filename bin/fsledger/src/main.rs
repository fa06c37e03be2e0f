//! fsledger - operator tool for the persistent object ledger
//!
//! Opens the ledger under the configured data directory (running recovery)
//! and inspects, checkpoints, repairs, cross-checks or rebuilds it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fsledger_common::{ItemLocator, LedgerConfig, ObjectKindTag};
use fsledger_store::StoreStats;
use fsledger_core::{
    CatalogSnapshot, CheckerOptions, ConsistencyChecker, FileSystemSnapshot, Ledger, SyncState,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fsledger")]
#[command(about = "Persistent object ledger operator tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FSLEDGER_CONFIG", default_value = "/etc/fsledger/ledger.toml")]
    config: PathBuf,

    /// Ledger data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Advance global sequences found behind the serial numbers in use
    #[arg(long)]
    repair_global_sequence: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every live record of one kind
    Scan {
        /// relation, database, tablespace or filespace
        kind: ObjectKindTag,
    },
    /// Print per-kind table statistics and the WAL size
    Stats,
    /// Write a checkpoint of every table and truncate the WAL
    Checkpoint,
    /// Free a record unconditionally
    RepairDelete {
        kind: ObjectKindTag,
        /// `index.generation` or `(index,generation)`
        locator: ItemLocator,
    },
    /// Cross-check the ledger against a catalog snapshot
    Check {
        /// Catalog snapshot (JSON)
        #[arg(long)]
        catalog: PathBuf,
        /// Root of the tablespace directories to scan
        #[arg(long)]
        fs_root: Option<PathBuf>,
        /// The mirror is not synchronized; skip the state checks
        #[arg(long)]
        not_in_sync: bool,
        /// Minimum created relation files expected per database
        #[arg(long, default_value = "100")]
        min_database_relations: usize,
    },
    /// Count live records and report leftovers of interrupted creates
    Integrity,
    /// Add a created record for every object in a catalog snapshot
    Rebuild {
        /// Catalog snapshot (JSON)
        #[arg(long)]
        catalog: PathBuf,
        /// Record the mirror copies as created and in sync
        #[arg(long)]
        mirrored: bool,
    },
    /// Free every relation, database and tablespace record
    Reset {
        /// Required; the ledger must be rebuilt afterwards
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Serialize)]
struct StatsOutput {
    tables: Vec<StoreStats>,
    wal_size_bytes: u64,
    checkpoint_advised: bool,
}

#[derive(Serialize)]
struct CheckLine<'a> {
    check: &'a str,
    violations: &'a [String],
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        LedgerConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        LedgerConfig::default()
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.repair_global_sequence {
        config.recovery.repair_global_sequence = true;
    }

    init_logging(&config.logging.level, args.log_json);

    info!("Opening ledger in {}", config.data_dir.display());
    let ledger = Ledger::open(&config)
        .with_context(|| format!("opening ledger in {}", config.data_dir.display()))?;

    match args.command {
        Command::Scan { kind } => {
            for row in ledger.scan_rows(kind) {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Command::Stats => {
            let stats = StatsOutput {
                tables: ledger.stats(),
                wal_size_bytes: ledger.wal_size_bytes(),
                checkpoint_advised: ledger.checkpoint_advised(),
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.checkpoint_advised {
                warn!(
                    "WAL holds {} bytes, at or above the {} byte limit; run a checkpoint",
                    stats.wal_size_bytes, config.wal.max_size_bytes
                );
            }
        }
        Command::Checkpoint => match ledger.checkpoint()? {
            Some(lsn) => info!("Checkpoint written at LSN {}", lsn),
            None => info!("Nothing to checkpoint"),
        },
        Command::RepairDelete { kind, locator } => {
            let name = ledger.repair_delete(kind, locator)?;
            ledger.flush_wal()?;
            warn!("Freed {} at {} by operator request", name, locator);
        }
        Command::Check {
            catalog,
            fs_root,
            not_in_sync,
            min_database_relations,
        } => {
            let catalog = CatalogSnapshot::load(&catalog)?;
            let filesystem = fs_root.map(FileSystemSnapshot::scan).transpose()?;
            let sync = if not_in_sync {
                SyncState::NotInSync
            } else {
                SyncState::InSync
            };

            let mut checker = ConsistencyChecker::new(&ledger, &catalog)
                .with_options(CheckerOptions { min_database_relations });
            if let Some(filesystem) = &filesystem {
                checker = checker.with_filesystem(filesystem);
            }
            let report = checker.run(sync);
            for result in &report.results {
                let line = CheckLine {
                    check: result.name,
                    violations: &result.violations,
                };
                println!("{}", serde_json::to_string(&line)?);
            }
            report.into_result()?;
            info!("All consistency checks passed");
        }
        Command::Integrity => {
            let report = ledger.startup_integrity_check();
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                anyhow::bail!("startup integrity check found leftovers");
            }
        }
        Command::Rebuild { catalog, mirrored } => {
            let catalog = CatalogSnapshot::load(&catalog)?;
            let summary = ledger.rebuild_from_catalog(&catalog, mirrored)?;
            // Relation nodes must be updated to the new locators
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Reset { yes } => {
            if !yes {
                anyhow::bail!("reset frees most of the ledger; pass --yes to proceed");
            }
            let summary = ledger.reset()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr; stdout carries the command output
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
