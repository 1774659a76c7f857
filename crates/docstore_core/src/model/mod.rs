//! Domain-facing data model for versioned documents.
//!
//! # Responsibility
//! - Define how an entity exposes its identity (`Entity`, `EntityKey`).
//! - Define the in-memory projection of a stored row (`Versioned`).
//!
//! # Invariants
//! - Identity is immutable after creation.
//! - Versions start at 1 and grow by exactly 1 per successful mutation.

pub mod entity;
pub mod versioned;
