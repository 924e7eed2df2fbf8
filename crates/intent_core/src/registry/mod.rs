//! Record-type registry.
//!
//! # Responsibility
//! - Map record-type names used in payloads to schema handles.
//! - Validate schema declarations once, at load time.
//!
//! # Invariants
//! - Registered names are lowercase and unique.
//! - Every reference field and relationship targets a registered schema.

pub mod schema_registry;
