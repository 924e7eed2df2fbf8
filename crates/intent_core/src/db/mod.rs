//! Record database bootstrap.
//!
//! # Responsibility
//! - Hand out SQLite connections the record store can use as-is.
//! - Bring older databases up to the `records`/`record_links` layout.
//!
//! # Invariants
//! - Layout version lives in `PRAGMA user_version`.
//! - A connection is returned only after every known migration is applied.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Connection bootstrap failure.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// Database was written by a newer build with an unknown layout.
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// One migration step failed; nothing from the batch was kept.
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite: {err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "record store layout version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Migration { version, source } => {
                write!(f, "record store migration {version} failed: {source}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
