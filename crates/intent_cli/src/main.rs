//! `intent-apply`: reconcile an intended state document into a record store.
//!
//! # Responsibility
//! - Load the schema registry config and open the SQLite store.
//! - Run one reconciliation and print its report.
//!
//! # Invariants
//! - Exit status is non-zero only for fatal failures; skipped records are
//!   reported as warnings.

use anyhow::{Context, Result};
use clap::Parser;
use intent_core::{
    default_log_level, init_logging, open_db, LogTarget, ReconcileFailure, ReconcileOptions,
    ReconcileReport, Reconciler, SchemaRegistry, SqliteRecordStore,
};
use log::info;
use std::io::Read;
use std::path::PathBuf;

/// Reconcile an intended state document into a record store.
#[derive(Debug, Parser)]
#[command(name = "intent-apply")]
#[command(version, about, long_about = None)]
struct Cli {
    /// SQLite database file; created and migrated when missing.
    #[arg(long)]
    db: PathBuf,

    /// JSON schema registry config.
    #[arg(long)]
    schemas: PathBuf,

    /// Roll back every write when a fatal error occurs.
    #[arg(long)]
    atomic: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Log level (trace|debug|info|warn|error).
    #[arg(long)]
    log_level: Option<String>,

    /// Absolute directory for rolling log files; logs go to stderr otherwise.
    #[arg(long)]
    log_dir: Option<String>,

    /// Intended state document, or `-` for stdin.
    document: String,
}

impl Cli {
    fn log_target(&self) -> Result<LogTarget> {
        match &self.log_dir {
            Some(dir) => LogTarget::directory(dir).map_err(anyhow::Error::msg),
            None => Ok(LogTarget::Stderr),
        }
    }

    fn options(&self) -> ReconcileOptions {
        ReconcileOptions {
            atomic: self.atomic,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.as_deref().unwrap_or(default_log_level());
    init_logging(level, cli.log_target()?).map_err(anyhow::Error::msg)?;

    let registry = SchemaRegistry::from_json_file(&cli.schemas)
        .with_context(|| format!("failed to load schemas from `{}`", cli.schemas.display()))?;
    let payload = read_document(&cli.document)?;

    let conn = open_db(&cli.db)
        .with_context(|| format!("failed to open database `{}`", cli.db.display()))?;
    let store = SqliteRecordStore::try_new(&conn).context("record store is not usable")?;
    info!(
        "event=cli_run module=cli status=start schemas={} atomic={}",
        registry.len(),
        cli.atomic
    );

    match Reconciler::new(&registry, &store).reconcile_json(&payload, &cli.options()) {
        Ok(report) => print_report(&report, cli.json),
        Err(failure) => {
            print_report(&failure.report, cli.json)?;
            Err(failure_error(failure))
        }
    }
}

fn read_document(source: &str) -> Result<String> {
    if source == "-" {
        let mut payload = String::new();
        std::io::stdin()
            .read_to_string(&mut payload)
            .context("failed to read document from stdin")?;
        return Ok(payload);
    }
    std::fs::read_to_string(source).with_context(|| format!("failed to read document `{source}`"))
}

fn failure_error(failure: ReconcileFailure) -> anyhow::Error {
    let rolled_back = failure.rolled_back;
    let error = anyhow::Error::new(failure);
    if rolled_back {
        error.context("no changes were kept")
    } else {
        error.context("records reconciled before the failure were kept")
    }
}

fn print_report(report: &ReconcileReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for outcome in &report.outcomes {
        let action = if outcome.created { "created" } else { "updated" };
        println!("{action} {} {}", outcome.schema, outcome.label);
    }
    for warning in &report.warnings {
        let field = warning
            .field
            .as_deref()
            .map(|field| format!(" field={field}"))
            .unwrap_or_default();
        eprintln!(
            "skipped {} #{} stage={}{field}: {}",
            warning.schema, warning.index, warning.stage, warning.message
        );
    }
    println!(
        "{} created, {} updated, {} skipped",
        report.created_count(),
        report.updated_count(),
        report.warnings.len()
    );
    Ok(())
}
