//! Domain model for intended state reconciliation.
//!
//! # Responsibility
//! - Define the payload shape (`IntendedState`, `RecordSpec`).
//! - Define record schemas, reference markers and resolved values.
//!
//! # Invariants
//! - Payload order is preserved end to end.
//! - Record identities are stable UUIDs scoped by schema name.

pub mod document;
pub mod reference;
pub mod schema;
pub mod value;
