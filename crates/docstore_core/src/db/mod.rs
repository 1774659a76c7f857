//! SQLite storage bootstrap and document table schema.
//!
//! # Responsibility
//! - Open and configure SQLite connections for document repositories.
//! - Create and verify the canonical document table shape.
//!
//! # Invariants
//! - Every returned connection has a non-zero busy timeout, so lock waits
//!   surface as `DatabaseBusy` instead of failing instantly.
//! - Table and column names are validated before they reach SQL text.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod open;
pub mod schema;

pub use open::{open_db, open_db_in_memory, open_db_with, DbOptions};
pub use schema::{create_document_table, ensure_document_table_ready, IdKind, TableSpec};

pub type DbResult<T> = Result<T, DbError>;

/// Low-level storage error shared by bootstrap and repository code.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// Table or column name is not a plain SQL identifier.
    InvalidIdentifier(String),
    /// Required table is missing.
    MissingRequiredTable(String),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: String,
        column: &'static str,
    },
    /// Blocking worker failed before producing a storage result.
    Worker(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::InvalidIdentifier(name) => {
                write!(f, "`{name}` is not a valid SQL identifier")
            }
            Self::MissingRequiredTable(table) => {
                write!(f, "document repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "document repository requires column `{column}` in table `{table}`"
            ),
            Self::Worker(message) => write!(f, "database worker failed: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::InvalidIdentifier(_) => None,
            Self::MissingRequiredTable(_) => None,
            Self::MissingRequiredColumn { .. } => None,
            Self::Worker(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
