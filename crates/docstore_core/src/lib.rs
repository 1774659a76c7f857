//! Versioned JSON document storage on SQLite.
//! Optimistic locking, chunked batch mutation and paginated counts over
//! `(id, version, document, created_at, modified_at)` tables.

pub mod codec;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;

pub use codec::{CodecError, DocumentCodec, JsonCodec};
pub use db::{
    create_document_table, open_db, open_db_in_memory, DbError, DbOptions, IdKind, TableSpec,
};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status, LogConfig};
pub use model::entity::{Entity, EntityKey};
pub use model::versioned::{Versioned, INITIAL_VERSION};
pub use repo::batch::{
    BatchDiagnostics, BatchEngine, BatchFailure, BatchReport, EntryOrdinalDiagnostics,
    DEFAULT_CHUNK_SIZE,
};
pub use repo::document_repo::{DocumentRepository, RepositoryConfig, SqliteDocumentRepository};
pub use repo::error::{ConflictError, ConflictReason, FailureKind, RepoError, RepoResult};
pub use repo::query::{DocumentQuery, Page};
pub use repo::transaction::{in_transaction, with_transaction, AsyncDatabase};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
