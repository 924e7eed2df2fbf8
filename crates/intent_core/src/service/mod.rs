//! Intended state use-case services.
//!
//! # Responsibility
//! - Resolve reference markers into stored records.
//! - Drive one intended state document through the record store.
//!
//! # Invariants
//! - Services depend on the `RecordStore` boundary, never on SQLite directly.
//! - Registry and store are injected by the caller.

pub mod reconciler;
pub mod resolver;
