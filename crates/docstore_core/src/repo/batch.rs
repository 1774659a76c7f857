//! Chunked batch execution.
//!
//! # Responsibility
//! - Apply one parameterized statement to many items in bounded chunks.
//! - Keep per-item affected-row counts visible to a caller-supplied handler.
//! - Recover the failing item of a failed chunk through `BatchDiagnostics`.
//!
//! # Invariants
//! - All chunks of one `execute` call share one transaction; any failure
//!   leaves zero net changes from that call, also when it joins an outer
//!   transaction (a savepoint scopes the call).
//! - Slice and stream sources produce identical chunk sequences for the same
//!   logical items.
//! - Diagnostics that cannot recover an ordinal degrade to the original
//!   classified error.

use super::error::{ConflictError, ConflictReason, RepoError, RepoResult};
use super::transaction::TransactionScope;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, CachedStatement, Connection};
use std::sync::Arc;
use std::time::Instant;

/// Default number of items per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50;

const BATCH_SAVEPOINT: &str = "docstore_batch";

static BATCH_ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)batch entry (\d+)").expect("valid batch entry regex"));

/// Producer of consecutive item chunks.
pub trait ChunkSource {
    type Item;

    /// Returns the next non-empty chunk, or `None` once items are exhausted.
    fn next_chunk(&mut self) -> Option<&[Self::Item]>;
}

/// Chunks an in-memory slice into zero-copy sub-slices.
pub struct SliceChunks<'a, T> {
    items: &'a [T],
    chunk_size: usize,
    position: usize,
}

impl<'a, T> SliceChunks<'a, T> {
    pub fn new(items: &'a [T], chunk_size: usize) -> Self {
        Self {
            items,
            chunk_size: chunk_size.max(1),
            position: 0,
        }
    }
}

impl<T> ChunkSource for SliceChunks<'_, T> {
    type Item = T;

    fn next_chunk(&mut self) -> Option<&[T]> {
        if self.position >= self.items.len() {
            return None;
        }
        let end = (self.position + self.chunk_size).min(self.items.len());
        let chunk = &self.items[self.position..end];
        self.position = end;
        Some(chunk)
    }
}

/// Pulls chunks from a one-pass iterator into one reused buffer.
///
/// Memory stays bounded by `chunk_size` items regardless of input length.
pub struct StreamChunks<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    chunk_size: usize,
}

impl<I: Iterator> StreamChunks<I> {
    pub fn new(source: impl IntoIterator<IntoIter = I>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            source: source.into_iter(),
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }
}

impl<I: Iterator> ChunkSource for StreamChunks<I> {
    type Item = I::Item;

    fn next_chunk(&mut self) -> Option<&[I::Item]> {
        self.buffer.clear();
        self.buffer.extend(self.source.by_ref().take(self.chunk_size));
        if self.buffer.is_empty() {
            None
        } else {
            Some(&self.buffer)
        }
    }
}

/// Failure of one chunk round trip, as reported by the driver.
#[derive(Debug)]
pub struct BatchFailure {
    /// Driver diagnostic text; its shape is backend specific.
    pub message: String,
    pub cause: rusqlite::Error,
}

/// Multi-row statement executed once per chunk.
pub trait BatchStatement {
    /// Executes every row of one chunk and returns one affected-row count per
    /// row, in chunk order.
    fn execute_chunk(&mut self, rows: &[Vec<Value>]) -> Result<Vec<usize>, BatchFailure>;
}

/// SQLite batch statement: one prepared statement re-bound per row.
pub struct SqliteBatchStatement<'conn> {
    statement: CachedStatement<'conn>,
}

impl<'conn> SqliteBatchStatement<'conn> {
    pub fn prepare(conn: &'conn Connection, sql: &str) -> RepoResult<Self> {
        Ok(Self {
            statement: conn.prepare_cached(sql)?,
        })
    }
}

impl BatchStatement for SqliteBatchStatement<'_> {
    fn execute_chunk(&mut self, rows: &[Vec<Value>]) -> Result<Vec<usize>, BatchFailure> {
        let mut counts = Vec::with_capacity(rows.len());
        for (ordinal, row) in rows.iter().enumerate() {
            match self.statement.execute(params_from_iter(row.iter())) {
                Ok(count) => counts.push(count),
                Err(cause) => {
                    return Err(BatchFailure {
                        message: format!("batch entry {ordinal} failed: {cause}"),
                        cause,
                    });
                }
            }
        }
        Ok(counts)
    }
}

/// Recovers which row of a failed chunk caused the failure.
pub trait BatchDiagnostics {
    /// Zero-based ordinal of the failing row within its chunk, when the
    /// diagnostic carries one.
    fn failed_ordinal(&self, failure: &BatchFailure) -> Option<usize>;
}

/// Reads the ordinal from `batch entry <n>` diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOrdinalDiagnostics;

impl BatchDiagnostics for EntryOrdinalDiagnostics {
    fn failed_ordinal(&self, failure: &BatchFailure) -> Option<usize> {
        BATCH_ENTRY_RE
            .captures(&failure.message)
            .and_then(|captures| captures.get(1))
            .and_then(|ordinal| ordinal.as_str().parse().ok())
    }
}

/// Turns items into statement parameters.
pub trait BatchBinder<T> {
    fn bind(&self, item: &T) -> RepoResult<Vec<Value>>;

    /// Human-readable identity of an item for error reports.
    fn describe(&self, _item: &T) -> Option<String> {
        None
    }
}

impl<T, F> BatchBinder<T> for F
where
    F: Fn(&T) -> RepoResult<Vec<Value>>,
{
    fn bind(&self, item: &T) -> RepoResult<Vec<Value>> {
        self(item)
    }
}

/// Outcome of one executed chunk handed to the count handler.
#[derive(Debug)]
pub struct ChunkResult<'a, T> {
    /// Batch-wide index of `items[0]`.
    pub offset: usize,
    pub items: &'a [T],
    pub counts: &'a [usize],
}

impl<'a, T> ChunkResult<'a, T> {
    /// First item whose statement affected no row, with its batch index.
    pub fn first_unaffected(&self) -> Option<(usize, &'a T)> {
        self.counts
            .iter()
            .position(|count| *count == 0)
            .map(|ordinal| (self.offset + ordinal, &self.items[ordinal]))
    }
}

/// Count handler that treats any unaffected row as a conflict.
pub fn conflict_on_unaffected<T>(chunk: &ChunkResult<'_, T>) -> RepoResult<()> {
    match chunk.first_unaffected() {
        Some((index, _)) => Err(RepoError::Conflict(
            ConflictError::new(ConflictReason::VersionMismatch).at_batch_index(index),
        )),
        None => Ok(()),
    }
}

/// Totals of one successful batch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Number of chunk round trips executed.
    pub chunks: usize,
    pub items: usize,
    pub affected_rows: usize,
}

/// Chunk size and diagnostics used for batch calls.
#[derive(Clone)]
pub struct BatchEngine {
    chunk_size: usize,
    diagnostics: Arc<dyn BatchDiagnostics + Send + Sync>,
}

impl Default for BatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl BatchEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            diagnostics: Arc::new(EntryOrdinalDiagnostics),
        }
    }

    /// Replaces the diagnostics used to recover failing items.
    pub fn with_diagnostics(
        mut self,
        diagnostics: impl BatchDiagnostics + Send + Sync + 'static,
    ) -> Self {
        self.diagnostics = Arc::new(diagnostics);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn slice_source<'a, T>(&self, items: &'a [T]) -> SliceChunks<'a, T> {
        SliceChunks::new(items, self.chunk_size)
    }

    pub fn stream_source<I: IntoIterator>(&self, items: I) -> StreamChunks<I::IntoIter> {
        StreamChunks::new(items, self.chunk_size)
    }

    /// Executes `sql` once per item, chunk by chunk, in one transaction.
    ///
    /// `handler` sees every chunk's affected-row counts right after the chunk
    /// runs; returning an error stops further chunks and rolls the whole call
    /// back.
    pub fn execute<S, B, H>(
        &self,
        conn: &Connection,
        sql: &str,
        source: S,
        binder: &B,
        handler: H,
    ) -> RepoResult<BatchReport>
    where
        S: ChunkSource,
        B: BatchBinder<S::Item> + ?Sized,
        H: FnMut(&ChunkResult<'_, S::Item>) -> RepoResult<()>,
    {
        let started_at = Instant::now();
        let scope = TransactionScope::begin_atomic(conn, BATCH_SAVEPOINT)?;
        let result = SqliteBatchStatement::prepare(conn, sql)
            .and_then(|mut statement| self.run_chunks(&mut statement, source, binder, handler));
        self.finish_logged(scope, result, started_at)
    }

    /// Same as `execute` with a caller-provided statement implementation.
    pub fn execute_with_statement<St, S, B, H>(
        &self,
        conn: &Connection,
        statement: &mut St,
        source: S,
        binder: &B,
        handler: H,
    ) -> RepoResult<BatchReport>
    where
        St: BatchStatement + ?Sized,
        S: ChunkSource,
        B: BatchBinder<S::Item> + ?Sized,
        H: FnMut(&ChunkResult<'_, S::Item>) -> RepoResult<()>,
    {
        let started_at = Instant::now();
        let scope = TransactionScope::begin_atomic(conn, BATCH_SAVEPOINT)?;
        let result = self.run_chunks(statement, source, binder, handler);
        self.finish_logged(scope, result, started_at)
    }

    fn finish_logged(
        &self,
        scope: TransactionScope<'_>,
        result: RepoResult<BatchReport>,
        started_at: Instant,
    ) -> RepoResult<BatchReport> {
        let owner = scope.is_owner();
        let result = scope.finish(result);
        match &result {
            Ok(report) => info!(
                "event=batch_execute module=batch status=ok chunks={} items={} affected_rows={} owner={} duration_ms={}",
                report.chunks,
                report.items,
                report.affected_rows,
                owner,
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=batch_execute module=batch status=error kind={:?} owner={} error={}",
                err.kind(),
                owner,
                err
            ),
        }
        result
    }

    fn run_chunks<St, S, B, H>(
        &self,
        statement: &mut St,
        mut source: S,
        binder: &B,
        mut handler: H,
    ) -> RepoResult<BatchReport>
    where
        St: BatchStatement + ?Sized,
        S: ChunkSource,
        B: BatchBinder<S::Item> + ?Sized,
        H: FnMut(&ChunkResult<'_, S::Item>) -> RepoResult<()>,
    {
        let mut report = BatchReport::default();
        let mut rows: Vec<Vec<Value>> = Vec::with_capacity(self.chunk_size);

        while let Some(chunk) = source.next_chunk() {
            rows.clear();
            for item in chunk {
                rows.push(binder.bind(item)?);
            }

            let offset = report.items;
            let counts = match statement.execute_chunk(&rows) {
                Ok(counts) => counts,
                Err(failure) => return Err(self.diagnose(failure, chunk, offset, binder)),
            };
            if counts.len() != chunk.len() {
                return Err(RepoError::InvalidData(format!(
                    "batch statement returned {} counts for {} rows",
                    counts.len(),
                    chunk.len()
                )));
            }

            report.chunks += 1;
            report.items += chunk.len();
            report.affected_rows += counts.iter().sum::<usize>();

            handler(&ChunkResult {
                offset,
                items: chunk,
                counts: &counts,
            })?;
        }

        Ok(report)
    }

    fn diagnose<T, B>(
        &self,
        failure: BatchFailure,
        chunk: &[T],
        offset: usize,
        binder: &B,
    ) -> RepoError
    where
        B: BatchBinder<T> + ?Sized,
    {
        match self.diagnostics.failed_ordinal(&failure) {
            Some(ordinal) if ordinal < chunk.len() => {
                let index = offset + ordinal;
                let id = binder.describe(&chunk[ordinal]);
                warn!(
                    "event=batch_diagnose module=batch status=ok index={index} id={}",
                    id.as_deref().unwrap_or("-")
                );
                let source = match RepoError::from(failure.cause) {
                    RepoError::Conflict(conflict) => {
                        RepoError::Conflict(conflict.with_id(id.clone()).at_batch_index(index))
                    }
                    other => other,
                };
                RepoError::BatchItem {
                    index,
                    id,
                    source: Box::new(source),
                }
            }
            _ => {
                warn!(
                    "event=batch_diagnose module=batch status=error error_code=ordinal_unrecovered"
                );
                RepoError::from(failure.cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BatchDiagnostics, BatchFailure, ChunkResult, ChunkSource, EntryOrdinalDiagnostics,
        SliceChunks, StreamChunks,
    };

    fn collect_chunks<S: ChunkSource>(mut source: S) -> Vec<Vec<S::Item>>
    where
        S::Item: Clone,
    {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk() {
            chunks.push(chunk.to_vec());
        }
        chunks
    }

    #[test]
    fn slice_and_stream_sources_yield_same_chunks() {
        for total in [0usize, 1, 10, 50, 51, 237] {
            let items: Vec<usize> = (0..total).collect();
            let from_slice = collect_chunks(SliceChunks::new(&items, 50));
            let from_stream = collect_chunks(StreamChunks::new(items.clone(), 50));
            assert_eq!(from_slice, from_stream, "total={total}");
            assert_eq!(from_slice.len(), total.div_ceil(50));
        }
    }

    #[test]
    fn stream_buffer_never_grows_past_chunk_size() {
        let mut source = StreamChunks::new(0..1_000usize, 7);
        let initial_capacity = source.buffer.capacity();
        let mut chunks = 0;
        while source.next_chunk().is_some() {
            assert!(source.buffer.len() <= 7);
            assert_eq!(source.buffer.capacity(), initial_capacity);
            chunks += 1;
        }
        assert_eq!(chunks, 143);
    }

    #[test]
    fn zero_chunk_size_is_treated_as_one() {
        let items = [1, 2, 3];
        assert_eq!(collect_chunks(SliceChunks::new(&items, 0)).len(), 3);
    }

    #[test]
    fn entry_diagnostics_read_ordinal_from_message() {
        let failure = BatchFailure {
            message: "Batch entry 17 failed: UNIQUE constraint failed: docs.id".to_string(),
            cause: rusqlite::Error::QueryReturnedNoRows,
        };
        assert_eq!(EntryOrdinalDiagnostics.failed_ordinal(&failure), Some(17));

        let unexpected = BatchFailure {
            message: "statement aborted".to_string(),
            cause: rusqlite::Error::QueryReturnedNoRows,
        };
        assert_eq!(EntryOrdinalDiagnostics.failed_ordinal(&unexpected), None);
    }

    #[test]
    fn first_unaffected_reports_batch_wide_index() {
        let items = ["a", "b", "c"];
        let counts = [1, 0, 0];
        let chunk = ChunkResult {
            offset: 100,
            items: &items[..],
            counts: &counts[..],
        };
        assert_eq!(chunk.first_unaffected(), Some((101, &"b")));
    }
}
