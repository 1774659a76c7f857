//! Stored row decoding.
//!
//! # Responsibility
//! - Read `(id, version, document, created_at, modified_at)` from a result row.
//! - Project a stored row into `Versioned<E>` through the document codec.
//!
//! # Invariants
//! - The five row columns are always selected first and in this order.
//! - The `id` column is authoritative and overrides any id in the document.
//! - Rows with a non-positive version are rejected, not masked.

use super::error::{RepoError, RepoResult};
use crate::codec::DocumentCodec;
use crate::model::entity::{Entity, EntityKey};
use crate::model::versioned::Versioned;
use rusqlite::types::ValueRef;
use rusqlite::Row;

/// Column list shared by every read statement.
pub(crate) const ROW_COLUMNS: &str = "id, version, document, created_at, modified_at";

/// Raw stored row before document decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow<K> {
    pub id: K,
    pub version: i64,
    pub document: String,
    pub created_at: i64,
    pub modified_at: i64,
}

impl<K: EntityKey> StoredRow<K> {
    /// Reads a row whose first five columns are `ROW_COLUMNS`.
    pub(crate) fn read(row: &Row<'_>) -> RepoResult<Self> {
        Self::read_optional(row)?
            .ok_or_else(|| RepoError::InvalidData("row has NULL id".to_string()))
    }

    /// Reads a row that may carry NULL entity columns, as produced by the
    /// outer join in count queries. Returns `None` when `id` is NULL.
    pub(crate) fn read_optional(row: &Row<'_>) -> RepoResult<Option<Self>> {
        let id = match row.get_ref(0)? {
            ValueRef::Null => return Ok(None),
            value => K::from_sql_value(value)
                .map_err(|message| RepoError::InvalidData(format!("{message} in id column")))?,
        };

        let version: i64 = row.get(1)?;
        if version < 1 {
            return Err(RepoError::InvalidData(format!(
                "invalid version `{version}` for id `{id}`"
            )));
        }

        Ok(Some(Self {
            id,
            version,
            document: row.get(2)?,
            created_at: row.get(3)?,
            modified_at: row.get(4)?,
        }))
    }

    /// Decodes the document and assigns the stored id into the entity.
    pub fn into_versioned<E, C>(self, codec: &C) -> RepoResult<Versioned<E>>
    where
        E: Entity<Id = K>,
        C: DocumentCodec<E>,
    {
        let mut item = codec.decode(&self.document)?;
        item.assign_id(self.id);
        Ok(Versioned {
            item,
            version: self.version,
            created_at: self.created_at,
            modified_at: self.modified_at,
        })
    }
}
