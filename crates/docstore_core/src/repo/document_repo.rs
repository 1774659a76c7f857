//! Versioned document repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide optimistic-locking CRUD over one document table.
//! - Expose chunked batch mutations, paginated queries and bulk rewrite.
//!
//! # Invariants
//! - `create` stores version 1; every successful mutation adds exactly 1.
//! - `update`/`delete` are conditional on `(id, previous_version)`; zero
//!   affected rows is a conflict whether the row is absent or stale.
//! - `created_at` never changes after insert; `modified_at` strictly grows.
//! - Every mutation runs in the connection's current transaction, or in an
//!   implicit one around the single call.

use super::batch::{BatchBinder, BatchEngine, BatchReport, ChunkResult, DEFAULT_CHUNK_SIZE};
use super::error::{ConflictError, RepoError, RepoResult};
use super::query::{count_sql, page_with_count_sql, select_page_sql, DocumentQuery, Page};
use super::row::{StoredRow, ROW_COLUMNS};
use super::transaction::{in_transaction, with_transaction};
use crate::codec::{DocumentCodec, JsonCodec};
use crate::db::{ensure_document_table_ready, IdKind, TableSpec};
use crate::model::entity::{Entity, EntityKey};
use crate::model::versioned::{Versioned, INITIAL_VERSION};
use log::debug;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest number of ids bound into one `IN (...)` list.
const IDS_PER_LOOKUP: usize = 500;

/// Repository tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Items per batch chunk. Larger chunks save round trips but hold more
    /// encoded documents in memory at once.
    pub chunk_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Repository interface for versioned document operations.
pub trait DocumentRepository<E: Entity> {
    /// Inserts `entity` with version 1. An existing id is a conflict.
    fn create(&self, entity: E) -> RepoResult<Versioned<E>>;
    /// Gets one entity; `for_update` requires an active transaction.
    fn get(&self, id: &E::Id, for_update: bool) -> RepoResult<Option<Versioned<E>>>;
    /// Like `get`, but a missing row is `RepoError::NotFound`.
    fn get_or_err(&self, id: &E::Id, for_update: bool) -> RepoResult<Versioned<E>>;
    fn exists(&self, id: &E::Id) -> RepoResult<bool>;
    /// Replaces the document when the stored version equals `previous_version`.
    fn update(&self, entity: E, previous_version: i64) -> RepoResult<Versioned<E>>;
    /// Removes the row when the stored version equals `previous_version`.
    fn delete(&self, id: &E::Id, previous_version: i64) -> RepoResult<()>;
    fn list_by_ids(&self, ids: &[E::Id]) -> RepoResult<Vec<Versioned<E>>>;
    fn list_all(&self) -> RepoResult<Vec<Versioned<E>>>;
    fn batch_create(&self, entities: &[E]) -> RepoResult<BatchReport>;
    fn batch_create_stream<I>(&self, entities: I) -> RepoResult<BatchReport>
    where
        I: IntoIterator<Item = E>;
    /// Updates each item conditional on its `version`.
    fn batch_update(&self, items: &[Versioned<E>]) -> RepoResult<BatchReport>;
    fn batch_update_stream<I>(&self, items: I) -> RepoResult<BatchReport>
    where
        I: IntoIterator<Item = Versioned<E>>;
    /// Deletes each `(id, previous_version)` pair.
    fn batch_delete(&self, items: &[(E::Id, i64)]) -> RepoResult<BatchReport>;
    fn query(&self, query: &DocumentQuery) -> RepoResult<Vec<Versioned<E>>>;
    fn query_with_total_count(&self, query: &DocumentQuery) -> RepoResult<Page<E>>;
    fn count(&self, query: &DocumentQuery) -> RepoResult<u64>;
    /// Re-encodes every stored document, optionally transformed, bumping each
    /// row's version. Returns the number of rewritten rows.
    fn rewrite_all(&self, transform: Option<&dyn Fn(E) -> E>) -> RepoResult<usize>;
}

/// SQLite-backed document repository bound to one connection and table.
pub struct SqliteDocumentRepository<'conn, E, C = JsonCodec> {
    conn: &'conn Connection,
    table: TableSpec,
    codec: C,
    batch: BatchEngine,
    _entity: PhantomData<fn() -> E>,
}

impl<'conn, E> SqliteDocumentRepository<'conn, E, JsonCodec>
where
    E: Entity + Serialize + DeserializeOwned,
{
    /// Constructs a JSON repository over an existing document table.
    pub fn try_new(conn: &'conn Connection, table: TableSpec) -> RepoResult<Self> {
        Self::with_codec(conn, table, JsonCodec)
    }
}

impl<'conn, E, C> SqliteDocumentRepository<'conn, E, C>
where
    E: Entity,
    C: DocumentCodec<E>,
{
    /// Constructs a repository with a custom document codec.
    pub fn with_codec(conn: &'conn Connection, table: TableSpec, codec: C) -> RepoResult<Self> {
        ensure_document_table_ready(conn, &table)?;
        Ok(Self {
            conn,
            table,
            codec,
            batch: BatchEngine::default(),
            _entity: PhantomData,
        })
    }

    pub fn with_config(mut self, config: &RepositoryConfig) -> Self {
        self.batch = BatchEngine::new(config.chunk_size);
        self
    }

    /// Replaces the batch engine, e.g. to swap batch diagnostics.
    pub fn with_batch_engine(mut self, engine: BatchEngine) -> Self {
        self.batch = engine;
        self
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub fn batch_engine(&self) -> &BatchEngine {
        &self.batch
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    fn table_name(&self) -> &str {
        self.table.name()
    }

    fn require_id(&self, entity: &E) -> RepoResult<E::Id> {
        entity.id().ok_or_else(|| {
            RepoError::InvalidData(format!(
                "entity for table `{}` has no id",
                self.table_name()
            ))
        })
    }

    fn insert_id_value(&self, entity: &E) -> RepoResult<Value> {
        match (entity.id(), self.table.id_kind()) {
            (Some(id), _) => Ok(id.to_sql_value()),
            (None, IdKind::Generated) => Ok(Value::Null),
            (None, IdKind::Text) => Err(RepoError::InvalidData(format!(
                "table `{}` requires a client-assigned id",
                self.table_name()
            ))),
        }
    }

    fn require_transaction(&self, for_update: bool, operation: &'static str) -> RepoResult<()> {
        if for_update && !in_transaction(self.conn) {
            return Err(RepoError::TransactionRequired(operation));
        }
        Ok(())
    }

    fn read_rows(&self, sql: &str, values: Vec<Value>) -> RepoResult<Vec<Versioned<E>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(StoredRow::<E::Id>::read(row)?.into_versioned(&self.codec)?);
        }
        Ok(items)
    }

    fn update_sql(&self) -> String {
        format!(
            "UPDATE {}
             SET version = version + 1,
                 document = ?3,
                 modified_at = MAX(modified_at + 1, ?4)
             WHERE id = ?1
               AND version = ?2",
            self.table_name()
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, version, document, created_at, modified_at)
             VALUES (?1, {INITIAL_VERSION}, ?2, ?3, ?3)",
            self.table_name()
        )
    }

    fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE id = ?1 AND version = ?2",
            self.table_name()
        )
    }

    fn version_conflict(&self, chunk: &ChunkResult<'_, Versioned<E>>) -> RepoResult<()> {
        match chunk.first_unaffected() {
            Some((index, item)) => {
                let id = item
                    .item
                    .id()
                    .map_or_else(|| "?".to_string(), |id| id.to_string());
                Err(ConflictError::version_mismatch(self.table_name(), id, item.version)
                    .at_batch_index(index)
                    .into())
            }
            None => Ok(()),
        }
    }

    fn create_conflict(&self, chunk: &ChunkResult<'_, E>) -> RepoResult<()> {
        match chunk.first_unaffected() {
            Some((index, item)) => Err(ConflictError::duplicate_key(None)
                .in_table(self.table_name())
                .with_id(item.id().map(|id| id.to_string()))
                .at_batch_index(index)
                .into()),
            None => Ok(()),
        }
    }
}

impl<E, C> DocumentRepository<E> for SqliteDocumentRepository<'_, E, C>
where
    E: Entity,
    C: DocumentCodec<E>,
{
    fn create(&self, mut entity: E) -> RepoResult<Versioned<E>> {
        let id_value = self.insert_id_value(&entity)?;
        let document = self.codec.encode(&entity)?;
        let now = now_epoch_ms();
        let sql = format!("{} RETURNING id;", self.insert_sql());

        let id = with_transaction(self.conn, |conn| {
            let stored = conn
                .query_row(&sql, params![id_value, document, now], |row| {
                    row.get::<_, Value>(0)
                })
                .map_err(|err| {
                    RepoError::from(err).with_conflict_context(
                        self.table_name(),
                        entity.id().map(|id| id.to_string()),
                    )
                })?;
            <E::Id as EntityKey>::from_sql_value(ValueRef::from(&stored))
                .map_err(RepoError::InvalidData)
        })?;

        debug!(
            "event=doc_create module=repo status=ok table={} id={id}",
            self.table_name()
        );
        entity.assign_id(id);
        Ok(Versioned {
            item: entity,
            version: INITIAL_VERSION,
            created_at: now,
            modified_at: now,
        })
    }

    fn get(&self, id: &E::Id, for_update: bool) -> RepoResult<Option<Versioned<E>>> {
        self.require_transaction(for_update, "get for update")?;
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE id = ?1;",
            self.table_name()
        );
        let mut items = self.read_rows(&sql, vec![id.to_sql_value()])?;
        Ok(items.pop())
    }

    fn get_or_err(&self, id: &E::Id, for_update: bool) -> RepoResult<Versioned<E>> {
        self.get(id, for_update)?.ok_or_else(|| RepoError::NotFound {
            table: self.table_name().to_string(),
            id: id.to_string(),
        })
    }

    fn exists(&self, id: &E::Id) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1);",
                self.table_name()
            ),
            [id.to_sql_value()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn update(&self, mut entity: E, previous_version: i64) -> RepoResult<Versioned<E>> {
        let id = self.require_id(&entity)?;
        let document = self.codec.encode(&entity)?;
        let sql = format!(
            "{} RETURNING id, version, created_at, modified_at;",
            self.update_sql()
        );

        let stored = with_transaction(self.conn, |conn| {
            Ok(conn
                .query_row(
                    &sql,
                    params![id.to_sql_value(), previous_version, document, now_epoch_ms()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((version, created_at, modified_at)) = stored else {
            debug!(
                "event=doc_update module=repo status=conflict table={} id={id} previous_version={previous_version}",
                self.table_name()
            );
            return Err(
                ConflictError::version_mismatch(self.table_name(), &id, previous_version).into(),
            );
        };

        entity.assign_id(id);
        Ok(Versioned {
            item: entity,
            version,
            created_at,
            modified_at,
        })
    }

    fn delete(&self, id: &E::Id, previous_version: i64) -> RepoResult<()> {
        let sql = self.delete_sql();
        let changed = with_transaction(self.conn, |conn| {
            Ok(conn.execute(&sql, params![id.to_sql_value(), previous_version])?)
        })?;

        if changed == 0 {
            debug!(
                "event=doc_delete module=repo status=conflict table={} id={id} previous_version={previous_version}",
                self.table_name()
            );
            return Err(
                ConflictError::version_mismatch(self.table_name(), id, previous_version).into(),
            );
        }
        Ok(())
    }

    fn list_by_ids(&self, ids: &[E::Id]) -> RepoResult<Vec<Versioned<E>>> {
        let mut items = Vec::with_capacity(ids.len());
        for group in ids.chunks(IDS_PER_LOOKUP) {
            let placeholders = vec!["?"; group.len()].join(", ");
            let sql = format!(
                "SELECT {ROW_COLUMNS} FROM {} WHERE id IN ({placeholders}) ORDER BY created_at ASC, id ASC;",
                self.table_name()
            );
            let values = group.iter().map(EntityKey::to_sql_value).collect();
            items.extend(self.read_rows(&sql, values)?);
        }
        if ids.len() <= IDS_PER_LOOKUP {
            return Ok(items);
        }

        // Merge lookup groups into the same `(created_at, id)` order SQL uses.
        let mut keyed: Vec<(i64, Value, Versioned<E>)> = items
            .into_iter()
            .map(|item| {
                let key = item.item.id().map_or(Value::Null, |id| id.to_sql_value());
                (item.created_at, key, item)
            })
            .collect();
        keyed.sort_by(|left, right| {
            left.0
                .cmp(&right.0)
                .then_with(|| sql_key_order(&left.1, &right.1))
        });
        Ok(keyed.into_iter().map(|(_, _, item)| item).collect())
    }

    fn list_all(&self) -> RepoResult<Vec<Versioned<E>>> {
        self.query(&DocumentQuery::all())
    }

    fn batch_create(&self, entities: &[E]) -> RepoResult<BatchReport> {
        let binder = CreateBinder::new(self);
        self.batch
            .execute(
                self.conn,
                &self.insert_sql(),
                self.batch.slice_source(entities),
                &binder,
                |chunk| self.create_conflict(chunk),
            )
            .map_err(|err| err.with_conflict_context(self.table_name(), None))
    }

    fn batch_create_stream<I>(&self, entities: I) -> RepoResult<BatchReport>
    where
        I: IntoIterator<Item = E>,
    {
        let binder = CreateBinder::new(self);
        self.batch
            .execute(
                self.conn,
                &self.insert_sql(),
                self.batch.stream_source(entities),
                &binder,
                |chunk| self.create_conflict(chunk),
            )
            .map_err(|err| err.with_conflict_context(self.table_name(), None))
    }

    fn batch_update(&self, items: &[Versioned<E>]) -> RepoResult<BatchReport> {
        let binder = UpdateBinder::new(self);
        self.batch.execute(
            self.conn,
            &self.update_sql(),
            self.batch.slice_source(items),
            &binder,
            |chunk| self.version_conflict(chunk),
        )
    }

    fn batch_update_stream<I>(&self, items: I) -> RepoResult<BatchReport>
    where
        I: IntoIterator<Item = Versioned<E>>,
    {
        let binder = UpdateBinder::new(self);
        self.batch.execute(
            self.conn,
            &self.update_sql(),
            self.batch.stream_source(items),
            &binder,
            |chunk| self.version_conflict(chunk),
        )
    }

    fn batch_delete(&self, items: &[(E::Id, i64)]) -> RepoResult<BatchReport> {
        let table = self.table_name();
        self.batch.execute(
            self.conn,
            &self.delete_sql(),
            self.batch.slice_source(items),
            &DeleteBinder,
            |chunk| match chunk.first_unaffected() {
                Some((index, (id, version))) => {
                    Err(ConflictError::version_mismatch(table, id, *version)
                        .at_batch_index(index)
                        .into())
                }
                None => Ok(()),
            },
        )
    }

    fn query(&self, query: &DocumentQuery) -> RepoResult<Vec<Versioned<E>>> {
        self.require_transaction(query.for_update, "query for update")?;
        let (sql, values) = select_page_sql(self.table_name(), query);
        self.read_rows(&sql, values)
    }

    fn query_with_total_count(&self, query: &DocumentQuery) -> RepoResult<Page<E>> {
        self.require_transaction(query.for_update, "query for update")?;
        let (sql, values) = page_with_count_sql(self.table_name(), query);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut page = Page::empty();
        while let Some(row) = rows.next()? {
            let total: i64 = row.get(5)?;
            page.total_count = u64::try_from(total).map_err(|_| {
                RepoError::InvalidData(format!("negative total count `{total}`"))
            })?;
            if let Some(stored) = StoredRow::<E::Id>::read_optional(row)? {
                page.items.push(stored.into_versioned(&self.codec)?);
            }
        }
        Ok(page)
    }

    fn count(&self, query: &DocumentQuery) -> RepoResult<u64> {
        let (sql, values) = count_sql(self.table_name(), query);
        let total: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        u64::try_from(total)
            .map_err(|_| RepoError::InvalidData(format!("negative total count `{total}`")))
    }

    fn rewrite_all(&self, transform: Option<&dyn Fn(E) -> E>) -> RepoResult<usize> {
        let page_sql = format!(
            "SELECT {ROW_COLUMNS} FROM {}
             WHERE ?1 IS NULL OR id > ?1
             ORDER BY id ASC
             LIMIT ?2;",
            self.table_name()
        );
        let page_size = i64::try_from(self.batch.chunk_size()).unwrap_or(i64::MAX);

        let rewritten = with_transaction(self.conn, |_| {
            let mut after = Value::Null;
            let mut rewritten = 0usize;
            loop {
                let page =
                    self.read_rows(&page_sql, vec![after.clone(), Value::Integer(page_size)])?;
                let Some(last) = page.last() else {
                    break;
                };
                after = self.require_id(&last.item)?.to_sql_value();

                let page: Vec<Versioned<E>> = match transform {
                    Some(transform) => page.into_iter().map(|item| item.map(transform)).collect(),
                    None => page,
                };
                rewritten += self.batch_update(&page)?.items;
            }
            Ok(rewritten)
        })?;

        debug!(
            "event=doc_rewrite module=repo status=ok table={} rows={rewritten}",
            self.table_name()
        );
        Ok(rewritten)
    }
}

struct CreateBinder<'r, 'conn, E, C> {
    repo: &'r SqliteDocumentRepository<'conn, E, C>,
    now: i64,
}

impl<'r, 'conn, E, C> CreateBinder<'r, 'conn, E, C> {
    fn new(repo: &'r SqliteDocumentRepository<'conn, E, C>) -> Self {
        Self {
            repo,
            now: now_epoch_ms(),
        }
    }
}

impl<E, C> BatchBinder<E> for CreateBinder<'_, '_, E, C>
where
    E: Entity,
    C: DocumentCodec<E>,
{
    fn bind(&self, item: &E) -> RepoResult<Vec<Value>> {
        Ok(vec![
            self.repo.insert_id_value(item)?,
            Value::Text(self.repo.codec.encode(item)?),
            Value::Integer(self.now),
        ])
    }

    fn describe(&self, item: &E) -> Option<String> {
        item.id().map(|id| id.to_string())
    }
}

struct UpdateBinder<'r, 'conn, E, C> {
    repo: &'r SqliteDocumentRepository<'conn, E, C>,
    now: i64,
}

impl<'r, 'conn, E, C> UpdateBinder<'r, 'conn, E, C> {
    fn new(repo: &'r SqliteDocumentRepository<'conn, E, C>) -> Self {
        Self {
            repo,
            now: now_epoch_ms(),
        }
    }
}

impl<E, C> BatchBinder<Versioned<E>> for UpdateBinder<'_, '_, E, C>
where
    E: Entity,
    C: DocumentCodec<E>,
{
    fn bind(&self, item: &Versioned<E>) -> RepoResult<Vec<Value>> {
        Ok(vec![
            self.repo.require_id(&item.item)?.to_sql_value(),
            Value::Integer(item.version),
            Value::Text(self.repo.codec.encode(&item.item)?),
            Value::Integer(self.now),
        ])
    }

    fn describe(&self, item: &Versioned<E>) -> Option<String> {
        item.item.id().map(|id| id.to_string())
    }
}

struct DeleteBinder;

impl<K: EntityKey> BatchBinder<(K, i64)> for DeleteBinder {
    fn bind(&self, item: &(K, i64)) -> RepoResult<Vec<Value>> {
        Ok(vec![item.0.to_sql_value(), Value::Integer(item.1)])
    }

    fn describe(&self, item: &(K, i64)) -> Option<String> {
        Some(item.0.to_string())
    }
}

/// SQLite ordering of id values: NULL, then integers, then text (binary
/// collation).
fn sql_key_order(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    match (left, right) {
        (Value::Integer(left), Value::Integer(right)) => left.cmp(right),
        (Value::Text(left), Value::Text(right)) => left.as_bytes().cmp(right.as_bytes()),
        (Value::Blob(left), Value::Blob(right)) => left.cmp(right),
        _ => rank(left).cmp(&rank(right)),
    }
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}
