//! Repository layer: versioned CRUD, batches, queries and transactions.
//!
//! # Responsibility
//! - Define the document repository contract and its SQLite implementation.
//! - Keep SQL, transaction scoping and error classification inside core.
//!
//! # Invariants
//! - Driver errors are classified once, at the first `?` that converts them
//!   into `RepoError`.
//! - A failed call leaves stored data exactly as it was before the call.

pub mod batch;
pub mod classify;
pub mod document_repo;
pub mod error;
pub mod query;
pub mod row;
pub mod transaction;
