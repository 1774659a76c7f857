//! Repository error taxonomy.
//!
//! # Responsibility
//! - Expose one error type whose variants map onto the stable failure kinds
//!   callers base retry decisions on.
//!
//! # Invariants
//! - `Conflict` is never reclassified: a zero-row conditional write stays a
//!   conflict whether the row was absent or stale.
//! - Only `FailureKind::Unavailable` is presumed safe to retry.

use crate::codec::CodecError;
use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Stable classification of a `RepoError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Optimistic-lock precondition failed or identity already exists.
    Conflict,
    /// Explicit lookup via `get_or_err` found nothing.
    NotFound,
    /// Transient transport condition (busy, locked, I/O); retry-safe.
    Unavailable,
    /// A specific batch item was identified as the cause of a batch failure.
    BatchItem,
    /// Anything else; not assumed safe to retry.
    Unknown,
}

/// Why a write was refused as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Conditional write matched zero rows. The row is either absent or was
    /// modified concurrently; the two cases are deliberately not told apart.
    VersionMismatch,
    /// Insert hit an existing primary/unique key.
    DuplicateKey,
}

/// Details of an optimistic-locking or uniqueness conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictError {
    pub reason: ConflictReason,
    pub table: Option<String>,
    /// Rendered id of the offending entity when it is known.
    pub id: Option<String>,
    /// `previous_version` the caller supplied, for version mismatches.
    pub expected_version: Option<i64>,
    /// Position of the offending item within a batch call.
    pub batch_index: Option<usize>,
    /// Driver diagnostic text for key violations.
    pub detail: Option<String>,
}

impl ConflictError {
    pub fn new(reason: ConflictReason) -> Self {
        Self {
            reason,
            table: None,
            id: None,
            expected_version: None,
            batch_index: None,
            detail: None,
        }
    }

    pub fn version_mismatch(table: &str, id: impl Display, expected_version: i64) -> Self {
        Self {
            reason: ConflictReason::VersionMismatch,
            table: Some(table.to_string()),
            id: Some(id.to_string()),
            expected_version: Some(expected_version),
            batch_index: None,
            detail: None,
        }
    }

    pub fn duplicate_key(detail: Option<String>) -> Self {
        Self {
            detail,
            ..Self::new(ConflictReason::DuplicateKey)
        }
    }

    pub fn in_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        if id.is_some() {
            self.id = id;
        }
        self
    }

    pub fn at_batch_index(mut self, index: usize) -> Self {
        self.batch_index = Some(index);
        self
    }
}

impl Display for ConflictError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let table = self.table.as_deref().unwrap_or("?");
        let id = self.id.as_deref().unwrap_or("?");
        match self.reason {
            ConflictReason::VersionMismatch => {
                write!(f, "conflict on {table}:{id}: row absent or version changed")?;
                if let Some(version) = self.expected_version {
                    write!(f, " (expected version {version})")?;
                }
            }
            ConflictReason::DuplicateKey => {
                write!(f, "conflict on {table}:{id}: identity already exists")?;
                if let Some(detail) = &self.detail {
                    write!(f, " ({detail})")?;
                }
            }
        }
        if let Some(index) = self.batch_index {
            write!(f, " at batch item {index}")?;
        }
        Ok(())
    }
}

impl Error for ConflictError {}

/// Error returned by every repository operation.
#[derive(Debug)]
pub enum RepoError {
    Conflict(ConflictError),
    NotFound {
        table: String,
        id: String,
    },
    Unavailable(DbError),
    Unknown(DbError),
    /// One item of a batch call caused the failure wrapped in `source`.
    BatchItem {
        index: usize,
        id: Option<String>,
        source: Box<RepoError>,
    },
    Codec(CodecError),
    /// Persisted row could not be projected into a valid entity.
    InvalidData(String),
    /// Operation needs an enclosing transaction (row-lock reads).
    TransactionRequired(&'static str),
    /// Rolling back after `original` failed too. `original` stays the primary
    /// error; `rollback` is the suppressed secondary failure.
    RollbackFailed {
        original: Box<RepoError>,
        rollback: DbError,
    },
}

impl RepoError {
    /// Returns the error that caused the failure, skipping rollback wrappers.
    pub fn primary(&self) -> &RepoError {
        match self {
            Self::RollbackFailed { original, .. } => original.primary(),
            other => other,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self.primary() {
            Self::Conflict(_) => FailureKind::Conflict,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::Unavailable(_) => FailureKind::Unavailable,
            Self::BatchItem { .. } => FailureKind::BatchItem,
            Self::Unknown(_)
            | Self::Codec(_)
            | Self::InvalidData(_)
            | Self::TransactionRequired(_)
            | Self::RollbackFailed { .. } => FailureKind::Unknown,
        }
    }

    /// Whether retrying the whole call is presumed safe.
    pub fn is_retryable(&self) -> bool {
        match self.primary() {
            Self::Unavailable(_) => true,
            Self::BatchItem { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == FailureKind::Conflict
    }

    /// Conflict details, including conflicts wrapped as a batch item cause.
    pub fn conflict(&self) -> Option<&ConflictError> {
        match self.primary() {
            Self::Conflict(conflict) => Some(conflict),
            Self::BatchItem { source, .. } => source.conflict(),
            _ => None,
        }
    }

    /// Fills conflict table/id when the classifier could not know them.
    pub(crate) fn with_conflict_context(self, table: &str, id: Option<String>) -> Self {
        match self {
            Self::Conflict(conflict) if conflict.table.is_none() => {
                Self::Conflict(conflict.in_table(table).with_id(id))
            }
            Self::Conflict(conflict) => Self::Conflict(conflict.with_id(id)),
            Self::BatchItem { index, id: item_id, source } => Self::BatchItem {
                index,
                id: item_id,
                source: Box::new(source.with_conflict_context(table, id)),
            },
            other => other,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict(err) => write!(f, "{err}"),
            Self::NotFound { table, id } => write!(f, "entity not found: {table}:{id}"),
            Self::Unavailable(err) => write!(f, "storage unavailable: {err}"),
            Self::Unknown(err) => write!(f, "{err}"),
            Self::BatchItem { index, id, source } => match id {
                Some(id) => write!(f, "batch item {index} ({id}) failed: {source}"),
                None => write!(f, "batch item {index} failed: {source}"),
            },
            Self::Codec(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted document data: {message}"),
            Self::TransactionRequired(operation) => {
                write!(f, "{operation} requires an active transaction")
            }
            Self::RollbackFailed { original, rollback } => {
                write!(f, "{original} (rollback also failed: {rollback})")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Conflict(err) => Some(err),
            Self::NotFound { .. } => None,
            Self::Unavailable(err) => Some(err),
            Self::Unknown(err) => Some(err),
            Self::BatchItem { source, .. } => Some(source.as_ref()),
            Self::Codec(err) => Some(err),
            Self::InvalidData(_) => None,
            Self::TransactionRequired(_) => None,
            Self::RollbackFailed { original, .. } => Some(original.as_ref()),
        }
    }
}

impl From<CodecError> for RepoError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<ConflictError> for RepoError {
    fn from(value: ConflictError) -> Self {
        Self::Conflict(value)
    }
}
