//! Record store layout migrations.
//!
//! # Invariants
//! - Steps are listed in strictly increasing version order.
//! - All pending steps commit together or not at all.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

/// One layout step: the SQL that moves a database to `version`.
#[derive(Debug, Clone, Copy)]
struct LayoutStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const LAYOUT_STEPS: &[LayoutStep] = &[
    LayoutStep {
        version: 1,
        name: "records",
        sql: include_str!("0001_records.sql"),
    },
    LayoutStep {
        version: 2,
        name: "record_links",
        sql: include_str!("0002_record_links.sql"),
    },
];

/// Layout version this build writes.
pub fn latest_version() -> u32 {
    LAYOUT_STEPS.last().map_or(0, |step| step.version)
}

/// Brings `conn` to the latest layout.
///
/// Databases newer than this build are rejected untouched.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = current_user_version(conn)?;
    let to = latest_version();
    if from > to {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: to,
        });
    }

    let pending = pending_steps(from);
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in &pending {
        tx.execute_batch(step.sql)
            .and_then(|()| tx.pragma_update(None, "user_version", step.version))
            .map_err(|source| DbError::Migration {
                version: step.version,
                source,
            })?;
    }
    tx.commit()?;

    let names: Vec<&str> = pending.iter().map(|step| step.name).collect();
    info!(
        "event=db_migrate module=db status=ok from_version={from} to_version={to} steps={}",
        names.join(",")
    );
    Ok(())
}

/// Reads the layout version recorded on the connection.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}

fn pending_steps(from: u32) -> Vec<LayoutStep> {
    LAYOUT_STEPS
        .iter()
        .filter(|step| step.version > from)
        .copied()
        .collect()
}
