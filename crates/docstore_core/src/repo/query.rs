//! Predicate queries with optional total count.
//!
//! # Responsibility
//! - Describe a filtered, ordered, paginated read (`DocumentQuery`).
//! - Build the SQL for page-only, count-only and page-plus-count reads.
//!
//! # Invariants
//! - Default ordering is `created_at` ascending with `id` as tie-breaker, so
//!   repeated calls paginate stably.
//! - The page-plus-count statement always returns at least one row: entity
//!   columns are NULL and `total_count` is set when the page is empty.
//! - Predicate parameters are bound once and appear before limit/offset.

use crate::model::versioned::Versioned;
use rusqlite::types::Value;

const DEFAULT_ORDER_BY: &str = "created_at";
const MATCH_ALL: &str = "1 = 1";

/// Filtered read over one document table.
///
/// `predicate` and `order_by` are SQL expressions over the columns `id`,
/// `version`, `document`, `created_at` and `modified_at`
/// (e.g. `json_extract(document, '$.status') = ?`). They are inserted into the
/// statement as-is and must come from trusted code, never from end users;
/// values belong in `params`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    pub predicate: String,
    pub params: Vec<Value>,
    pub limit: Option<u32>,
    pub offset: u32,
    pub order_by: Option<String>,
    pub order_desc: bool,
    /// Read rows under the write lock; needs an active transaction.
    pub for_update: bool,
}

impl DocumentQuery {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(predicate: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            predicate: predicate.into(),
            params,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn order_by(mut self, expression: impl Into<String>) -> Self {
        self.order_by = Some(expression.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order_desc = true;
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    fn predicate_sql(&self) -> &str {
        let trimmed = self.predicate.trim();
        if trimmed.is_empty() {
            MATCH_ALL
        } else {
            trimmed
        }
    }

    fn order_sql(&self) -> String {
        let expression = self
            .order_by
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ORDER_BY);
        let direction = if self.order_desc { "DESC" } else { "ASC" };
        format!("{expression} {direction}, id ASC")
    }

    /// Predicate parameters followed by limit and offset.
    fn paged_params(&self) -> Vec<Value> {
        let mut values = self.params.clone();
        values.push(Value::Integer(self.limit.map_or(-1, i64::from)));
        values.push(Value::Integer(i64::from(self.offset)));
        values
    }
}

/// One page of matches plus the number of matches ignoring limit/offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<E> {
    pub items: Vec<Versioned<E>>,
    pub total_count: u64,
}

impl<E> Page<E> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_count: 0,
        }
    }
}

pub(crate) fn select_page_sql(table: &str, query: &DocumentQuery) -> (String, Vec<Value>) {
    let sql = format!(
        "SELECT id, version, document, created_at, modified_at
         FROM {table}
         WHERE ({predicate})
         ORDER BY {order}
         LIMIT ? OFFSET ?;",
        predicate = query.predicate_sql(),
        order = query.order_sql(),
    );
    (sql, query.paged_params())
}

pub(crate) fn count_sql(table: &str, query: &DocumentQuery) -> (String, Vec<Value>) {
    let sql = format!(
        "SELECT COUNT(*) FROM {table} WHERE ({predicate});",
        predicate = query.predicate_sql(),
    );
    (sql, query.params.clone())
}

/// Page and total count in one round trip.
///
/// `base` is the filtered set, `page` the ordered/limited view of it and
/// `total` its size; `total LEFT JOIN page` keeps the count row alive when the
/// page is empty.
pub(crate) fn page_with_count_sql(table: &str, query: &DocumentQuery) -> (String, Vec<Value>) {
    let sql = format!(
        "WITH base AS (
            SELECT id, version, document, created_at, modified_at
            FROM {table}
            WHERE ({predicate})
        ),
        page AS (
            SELECT
                base.*,
                ROW_NUMBER() OVER (ORDER BY {order}) AS page_position
            FROM base
            ORDER BY page_position
            LIMIT ? OFFSET ?
        ),
        total AS (
            SELECT COUNT(*) AS total_count FROM base
        )
        SELECT
            page.id,
            page.version,
            page.document,
            page.created_at,
            page.modified_at,
            total.total_count
        FROM total
        LEFT JOIN page ON 1 = 1
        ORDER BY page.page_position;",
        predicate = query.predicate_sql(),
        order = query.order_sql(),
    );
    (sql, query.paged_params())
}
