//! fsledger common - shared types, errors and configuration
//!
//! This crate provides the identifiers, state enums, error taxonomy and
//! configuration used by every fsledger component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{LedgerConfig, LedgerMode, WalConfig};
pub use error::{Error, Result};
pub use types::*;
