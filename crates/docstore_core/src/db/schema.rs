//! Document table definition and verification.
//!
//! # Responsibility
//! - Describe one document table (`TableSpec`) and its identifier strategy.
//! - Create the canonical `(id, version, document, created_at, modified_at)`
//!   shape and verify that an existing table still carries it.
//!
//! # Invariants
//! - Table names are plain identifiers; nothing else is interpolated into SQL.

use super::{DbError, DbResult};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// SQLite keywords; a table named after one breaks every unquoted statement.
const SQL_KEYWORDS: [&str; 147] = [
    "ABORT", "ACTION", "ADD", "AFTER", "ALL", "ALTER", "ALWAYS", "ANALYZE", "AND", "AS", "ASC",
    "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN", "BETWEEN", "BY", "CASCADE", "CASE", "CAST",
    "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT", "CONSTRAINT", "CREATE", "CROSS",
    "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DATABASE", "DEFAULT",
    "DEFERRABLE", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO", "DROP", "EACH",
    "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUDE", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL",
    "FILTER", "FIRST", "FOLLOWING", "FOR", "FOREIGN", "FROM", "FULL", "GENERATED", "GLOB",
    "GROUP", "GROUPS", "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED",
    "INITIALLY", "INNER", "INSERT", "INSTEAD", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN",
    "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH", "MATERIALIZED", "NATURAL", "NO", "NOT",
    "NOTHING", "NOTNULL", "NULL", "NULLS", "OF", "OFFSET", "ON", "OR", "ORDER", "OTHERS",
    "OUTER", "OVER", "PARTITION", "PLAN", "PRAGMA", "PRECEDING", "PRIMARY", "QUERY", "RAISE",
    "RANGE", "RECURSIVE", "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE",
    "RESTRICT", "RETURNING", "RIGHT", "ROLLBACK", "ROW", "ROWS", "SAVEPOINT", "SELECT", "SET",
    "TABLE", "TEMP", "TEMPORARY", "THEN", "TIES", "TO", "TRANSACTION", "TRIGGER", "UNBOUNDED",
    "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN",
    "WHERE", "WINDOW", "WITH", "WITHOUT",
];

const REQUIRED_COLUMNS: [&str; 5] = ["id", "version", "document", "created_at", "modified_at"];

/// How row identity is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Caller supplies the id (UUID or other string key).
    Text,
    /// Database assigns a sequence-backed integer on insert.
    Generated,
}

/// Validated name and identity strategy of one document table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    id_kind: IdKind,
}

impl TableSpec {
    /// Builds a table spec, rejecting names that are not plain identifiers.
    pub fn new(name: impl Into<String>, id_kind: IdKind) -> DbResult<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self { name, id_kind })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_kind(&self) -> IdKind {
        self.id_kind
    }
}

/// Returns an error unless `name` matches `[A-Za-z_][A-Za-z0-9_]*`, is not a
/// SQL keyword and does not use the reserved `sqlite_` prefix.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let upper = name.to_ascii_uppercase();
    if IDENTIFIER_RE.is_match(name)
        && !upper.starts_with("SQLITE_")
        && !SQL_KEYWORDS.contains(&upper.as_str())
    {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Creates the document table and its `created_at` index when missing.
pub fn create_document_table(conn: &Connection, spec: &TableSpec) -> DbResult<()> {
    let id_column = match spec.id_kind {
        IdKind::Text => "id TEXT PRIMARY KEY NOT NULL",
        IdKind::Generated => "id INTEGER PRIMARY KEY AUTOINCREMENT",
    };
    let table = spec.name();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            {id_column},
            version INTEGER NOT NULL CHECK (version >= 1),
            document TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table} (created_at);"
    ))?;
    Ok(())
}

/// Verifies that the table exists and has every column the repository reads.
pub fn ensure_document_table_ready(conn: &Connection, spec: &TableSpec) -> DbResult<()> {
    if !table_exists(conn, spec.name())? {
        return Err(DbError::MissingRequiredTable(spec.name().to_string()));
    }

    let columns = table_columns(conn, spec.name())?;
    for column in REQUIRED_COLUMNS {
        if !columns.iter().any(|current| current == column) {
            return Err(DbError::MissingRequiredColumn {
                table: spec.name().to_string(),
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::{validate_identifier, IdKind, TableSpec};

    #[test]
    fn identifiers_must_be_plain_names() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("_orders_v2").is_ok());
        assert!(validate_identifier("2orders").is_err());
        assert!(validate_identifier("orders; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn keywords_and_reserved_prefix_are_rejected() {
        for name in ["order", "SELECT", "Group", "values", "sqlite_master", "SQLITE_seq"] {
            assert!(validate_identifier(name).is_err(), "name={name}");
        }
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("selection").is_ok());
        assert!(validate_identifier("my_sqlite_docs").is_ok());
    }

    #[test]
    fn table_spec_rejects_invalid_name() {
        assert!(TableSpec::new("bad-name", IdKind::Text).is_err());
        let spec = TableSpec::new("widgets", IdKind::Generated).unwrap();
        assert_eq!(spec.name(), "widgets");
        assert_eq!(spec.id_kind(), IdKind::Generated);
    }
}
