//! Transaction propagation for document repositories.
//!
//! # Responsibility
//! - Let nested repository calls share one transaction on one connection.
//! - Provide the scoped begin/commit/rollback guard used by single-row
//!   mutations and batch operations.
//! - Run units of work from async tasks without blocking the runtime.
//!
//! # Invariants
//! - The connection is the unit-of-work handle: a call made while the
//!   connection already has an open transaction joins it (flat nesting).
//! - Only the scope that issued `BEGIN` commits or rolls back.
//! - A scope dropped without being finished rolls back.
//! - A connection must not be used from two threads or tasks at once; callers
//!   own that guarantee. `AsyncDatabase` serialises access with a mutex.

use super::error::{RepoError, RepoResult};
use crate::db::DbError;
use log::{debug, warn};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeMode {
    /// This scope issued `BEGIN IMMEDIATE` and ends the transaction.
    Owned,
    /// An outer scope owns the transaction; finishing is a no-op.
    Joined,
    /// An outer scope owns the transaction; this scope can still undo its own
    /// statements through a named savepoint.
    Savepoint(&'static str),
}

/// Scoped transaction boundary on one connection.
pub(crate) struct TransactionScope<'conn> {
    conn: &'conn Connection,
    mode: ScopeMode,
    finished: bool,
}

impl<'conn> TransactionScope<'conn> {
    /// Begins a transaction unless one is already active on `conn`.
    pub(crate) fn begin(conn: &'conn Connection) -> Result<Self, DbError> {
        if !conn.is_autocommit() {
            return Ok(Self::new(conn, ScopeMode::Joined));
        }
        conn.execute_batch("BEGIN IMMEDIATE;")?;
        debug!("event=tx_begin module=transaction status=ok mode=owned");
        Ok(Self::new(conn, ScopeMode::Owned))
    }

    /// Like `begin`, but when joining an outer transaction opens a savepoint
    /// so that `rollback` discards only this scope's changes.
    pub(crate) fn begin_atomic(
        conn: &'conn Connection,
        savepoint: &'static str,
    ) -> Result<Self, DbError> {
        if conn.is_autocommit() {
            return Self::begin(conn);
        }
        conn.execute_batch(&format!("SAVEPOINT {savepoint};"))?;
        debug!("event=tx_begin module=transaction status=ok mode=savepoint name={savepoint}");
        Ok(Self::new(conn, ScopeMode::Savepoint(savepoint)))
    }

    fn new(conn: &'conn Connection, mode: ScopeMode) -> Self {
        Self {
            conn,
            mode,
            finished: false,
        }
    }

    /// Whether this scope started the outermost transaction.
    pub(crate) fn is_owner(&self) -> bool {
        self.mode == ScopeMode::Owned
    }

    /// Commits an owned transaction or releases a savepoint.
    ///
    /// A failed COMMIT can leave the transaction open; it is rolled back here
    /// and a failing cleanup is attached to the commit error.
    pub(crate) fn commit(mut self) -> RepoResult<()> {
        self.finished = true;
        match self.mode {
            ScopeMode::Joined => Ok(()),
            ScopeMode::Savepoint(name) => {
                self.conn.execute_batch(&format!("RELEASE {name};"))?;
                Ok(())
            }
            ScopeMode::Owned => match self.conn.execute_batch("COMMIT;") {
                Ok(()) => {
                    debug!("event=tx_commit module=transaction status=ok");
                    Ok(())
                }
                Err(err) => {
                    warn!("event=tx_commit module=transaction status=error error={err}");
                    let original = RepoError::from(err);
                    if self.conn.is_autocommit() {
                        return Err(original);
                    }
                    match self.rollback_inner() {
                        Ok(()) => Err(original),
                        Err(rollback) => {
                            warn!(
                                "event=tx_rollback module=transaction status=error error_code=commit_cleanup_failed error={rollback}"
                            );
                            Err(RepoError::RollbackFailed {
                                original: Box::new(original),
                                rollback,
                            })
                        }
                    }
                }
            },
        }
    }

    pub(crate) fn rollback(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.rollback_inner()
    }

    fn rollback_inner(&self) -> Result<(), DbError> {
        match self.mode {
            ScopeMode::Joined => Ok(()),
            ScopeMode::Savepoint(name) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))?;
                debug!("event=tx_rollback module=transaction status=ok mode=savepoint name={name}");
                Ok(())
            }
            ScopeMode::Owned => {
                self.conn.execute_batch("ROLLBACK;")?;
                debug!("event=tx_rollback module=transaction status=ok mode=owned");
                Ok(())
            }
        }
    }

    /// Commits on `Ok`, rolls back on `Err`.
    ///
    /// A failing rollback is attached to the original error, which stays the
    /// primary one.
    pub(crate) fn finish<T>(self, result: RepoResult<T>) -> RepoResult<T> {
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => match self.rollback() {
                Ok(()) => Err(err),
                Err(rollback) => {
                    warn!(
                        "event=tx_rollback module=transaction status=error error_code=rollback_failed error={rollback}"
                    );
                    Err(RepoError::RollbackFailed {
                        original: Box::new(err),
                        rollback,
                    })
                }
            },
        }
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.rollback_inner() {
            warn!(
                "event=tx_rollback module=transaction status=error error_code=unwind_rollback_failed error={err}"
            );
        }
    }
}

/// Returns whether `conn` currently has an open transaction.
pub fn in_transaction(conn: &Connection) -> bool {
    !conn.is_autocommit()
}

/// Runs `block` inside one transaction on `conn`.
///
/// When `conn` already has an active transaction, `block` joins it and the
/// outer caller decides the outcome. Otherwise a transaction is started with
/// `BEGIN IMMEDIATE`, committed when `block` returns `Ok`, and rolled back
/// when it returns `Err` or panics.
pub fn with_transaction<T, F>(conn: &Connection, block: F) -> RepoResult<T>
where
    F: FnOnce(&Connection) -> RepoResult<T>,
{
    let scope = TransactionScope::begin(conn)?;
    let result = block(conn);
    scope.finish(result)
}

/// Connection wrapper for callers running on an async runtime.
///
/// Each unit of work moves onto a blocking thread together with exclusive
/// access to the connection, so the transaction handle travels with the work
/// item across await points and is never visible to other tasks.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl AsyncDatabase {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `work` inside one transaction on a blocking thread.
    pub async fn unit_of_work<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection) -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |conn| with_transaction(conn, work)).await
    }

    /// Runs `work` on a blocking thread without opening a transaction.
    ///
    /// Mutating repository calls made inside still open their own implicit
    /// transaction per call.
    pub async fn run<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection) -> RepoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let joined = tokio::task::spawn_blocking(move || {
            let guard = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    // Scopes roll back while unwinding, so the connection is
                    // reusable once any transaction left open is discarded.
                    let guard = poisoned.into_inner();
                    conn.clear_poison();
                    warn!("event=async_db module=transaction status=recovered error_code=mutex_poisoned");
                    if !guard.is_autocommit() {
                        guard.execute_batch("ROLLBACK;")?;
                    }
                    guard
                }
            };
            work(&guard)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(RepoError::Unknown(DbError::Worker(err.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{with_transaction, TransactionScope};
    use crate::db::open_db_in_memory;
    use crate::repo::error::{ConflictError, ConflictReason, FailureKind, RepoError};

    fn count(conn: &rusqlite::Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn failed_rollback_is_attached_to_the_original_error() {
        let conn = open_db_in_memory().unwrap();

        let err = with_transaction(&conn, |conn| -> crate::repo::error::RepoResult<()> {
            // Ends the transaction behind the scope's back so ROLLBACK fails.
            conn.execute_batch("COMMIT;")?;
            Err(ConflictError::new(ConflictReason::VersionMismatch).into())
        })
        .unwrap_err();

        assert!(matches!(err, RepoError::RollbackFailed { .. }));
        assert!(matches!(err.primary(), RepoError::Conflict(_)));
        assert_eq!(err.kind(), FailureKind::Conflict);
        assert!(err.is_conflict());
        assert!(conn.is_autocommit());
    }

    #[test]
    fn failed_commit_rolls_back_and_reports_commit_error() {
        let conn = open_db_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id TEXT PRIMARY KEY);
             CREATE TABLE child (
                 id TEXT PRIMARY KEY,
                 parent_id TEXT REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
             );",
        )
        .unwrap();

        let err = with_transaction(&conn, |conn| {
            conn.execute("INSERT INTO child (id, parent_id) VALUES ('c-1', 'missing');", [])?;
            Ok(())
        })
        .unwrap_err();

        assert!(!matches!(err, RepoError::RollbackFailed { .. }));
        assert_eq!(err.kind(), FailureKind::Unknown);
        assert!(conn.is_autocommit());
        assert_eq!(count(&conn, "child"), 0);
    }

    #[test]
    fn savepoint_scope_undoes_only_its_own_statements() {
        let conn = open_db_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY);")
            .unwrap();

        let outer = TransactionScope::begin(&conn).unwrap();
        assert!(outer.is_owner());
        conn.execute("INSERT INTO items (id) VALUES ('kept');", [])
            .unwrap();

        let inner = TransactionScope::begin_atomic(&conn, "test_scope").unwrap();
        assert!(!inner.is_owner());
        conn.execute("INSERT INTO items (id) VALUES ('undone');", [])
            .unwrap();
        inner.rollback().unwrap();

        outer.commit().unwrap();
        assert_eq!(count(&conn, "items"), 1);
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let conn = open_db_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY);")
            .unwrap();

        {
            let _scope = TransactionScope::begin(&conn).unwrap();
            conn.execute("INSERT INTO items (id) VALUES ('lost');", [])
                .unwrap();
        }

        assert!(conn.is_autocommit());
        assert_eq!(count(&conn, "items"), 0);
    }
}
