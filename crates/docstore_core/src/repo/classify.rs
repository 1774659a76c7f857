//! Classification of raw SQLite failures.
//!
//! # Responsibility
//! - Map `rusqlite::Error` into `RepoError` kinds at the first `?`, before any
//!   caller-specific remapping.
//!
//! # Invariants
//! - Primary/unique key violations become `Conflict`.
//! - Busy, locked, open and I/O failures become `Unavailable`.
//! - Everything else becomes `Unknown`.

use super::error::{ConflictError, FailureKind, RepoError};
use crate::db::DbError;
use rusqlite::{ffi, ErrorCode};

/// Classifies one driver error into the repository taxonomy.
pub fn classify_sqlite_error(err: rusqlite::Error) -> RepoError {
    match sqlite_failure_kind(&err) {
        FailureKind::Conflict => {
            let detail = match &err {
                rusqlite::Error::SqliteFailure(_, message) => message.clone(),
                _ => None,
            };
            RepoError::Conflict(ConflictError::duplicate_key(detail))
        }
        FailureKind::Unavailable => RepoError::Unavailable(DbError::Sqlite(err)),
        _ => RepoError::Unknown(DbError::Sqlite(err)),
    }
}

/// Returns the failure kind a driver error would be classified as.
pub fn sqlite_failure_kind(err: &rusqlite::Error) -> FailureKind {
    let rusqlite::Error::SqliteFailure(failure, _) = err else {
        return FailureKind::Unknown;
    };

    match failure.code {
        ErrorCode::ConstraintViolation => match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
                FailureKind::Conflict
            }
            _ => FailureKind::Unknown,
        },
        ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked
        | ErrorCode::CannotOpen
        | ErrorCode::SystemIoFailure
        | ErrorCode::FileLockingProtocolFailed
        | ErrorCode::OperationInterrupted => FailureKind::Unavailable,
        _ => FailureKind::Unknown,
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        classify_sqlite_error(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => classify_sqlite_error(err),
            other => RepoError::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_sqlite_error, sqlite_failure_kind};
    use crate::repo::error::{ConflictReason, FailureKind, RepoError};
    use rusqlite::{ffi, ErrorCode};

    fn failure(extended_code: i32, message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error::new(extended_code),
            Some(message.to_string()),
        )
    }

    #[test]
    fn primary_key_violation_is_conflict() {
        let err = classify_sqlite_error(failure(
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY,
            "UNIQUE constraint failed: docs.id",
        ));
        match err {
            RepoError::Conflict(conflict) => {
                assert_eq!(conflict.reason, ConflictReason::DuplicateKey);
                assert_eq!(
                    conflict.detail.as_deref(),
                    Some("UNIQUE constraint failed: docs.id")
                );
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn busy_and_locked_are_unavailable_and_retryable() {
        for code in [ffi::SQLITE_BUSY, ffi::SQLITE_LOCKED, ffi::SQLITE_IOERR] {
            let err = classify_sqlite_error(failure(code, "transient"));
            assert_eq!(err.kind(), FailureKind::Unavailable);
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn check_constraint_and_other_errors_are_unknown() {
        let err = failure(ffi::SQLITE_CONSTRAINT_CHECK, "CHECK constraint failed");
        assert_eq!(sqlite_failure_kind(&err), FailureKind::Unknown);

        let err = classify_sqlite_error(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.kind(), FailureKind::Unknown);
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_code_mapping_uses_primary_code() {
        let err = ffi::Error::new(ffi::SQLITE_BUSY);
        assert_eq!(err.code, ErrorCode::DatabaseBusy);
    }
}
