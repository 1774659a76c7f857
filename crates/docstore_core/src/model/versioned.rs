//! Versioned projection of a stored document row.

use serde::{Deserialize, Serialize};

/// Version assigned by a successful `create`.
pub const INITIAL_VERSION: i64 = 1;

/// Entity plus its optimistic-locking metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<E> {
    pub item: E,
    /// Current stored version; pass it back as `previous_version` to mutate.
    pub version: i64,
    /// Epoch milliseconds, set once by `create`.
    pub created_at: i64,
    /// Epoch milliseconds, strictly increasing across updates.
    pub modified_at: i64,
}

impl<E> Versioned<E> {
    /// Replaces the entity while keeping version metadata.
    pub fn map<F, T>(self, f: F) -> Versioned<T>
    where
        F: FnOnce(E) -> T,
    {
        Versioned {
            item: f(self.item),
            version: self.version,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }

    /// Version the row will carry after the next successful update.
    pub fn next_version(&self) -> i64 {
        self.version + 1
    }
}
