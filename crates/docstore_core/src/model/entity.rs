//! Entity identity contracts.
//!
//! # Responsibility
//! - Map entity ids to and from SQL values without reflection.
//! - Let the repository assign database-generated ids back into entities.

use rusqlite::types::{Value, ValueRef};
use std::fmt::{Debug, Display};
use uuid::Uuid;

/// Identifier type that can be stored in the `id` column.
pub trait EntityKey: Clone + Debug + Display + PartialEq + Send + Sync + 'static {
    /// Converts the id into the value bound for the `id` column.
    fn to_sql_value(&self) -> Value;

    /// Parses a stored `id` column value.
    ///
    /// Returns a human-readable message when the stored value has the wrong
    /// type or shape.
    fn from_sql_value(value: ValueRef<'_>) -> Result<Self, String>;
}

impl EntityKey for String {
    fn to_sql_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_sql_value(value: ValueRef<'_>) -> Result<Self, String> {
        value
            .as_str()
            .map(str::to_string)
            .map_err(|err| format!("expected text id: {err}"))
    }
}

impl EntityKey for Uuid {
    fn to_sql_value(&self) -> Value {
        Value::Text(self.to_string())
    }

    fn from_sql_value(value: ValueRef<'_>) -> Result<Self, String> {
        let text = value
            .as_str()
            .map_err(|err| format!("expected uuid text id: {err}"))?;
        Uuid::parse_str(text).map_err(|_| format!("invalid uuid value `{text}`"))
    }
}

impl EntityKey for i64 {
    fn to_sql_value(&self) -> Value {
        Value::Integer(*self)
    }

    fn from_sql_value(value: ValueRef<'_>) -> Result<Self, String> {
        value
            .as_i64()
            .map_err(|err| format!("expected integer id: {err}"))
    }
}

/// An entity persisted as one document row.
///
/// Client-assigned entities always return `Some` from `id()`. Entities whose
/// table uses `IdKind::Generated` return `None` until the first `create`, at
/// which point the repository calls `assign_id` with the new key.
pub trait Entity {
    type Id: EntityKey;

    fn id(&self) -> Option<Self::Id>;

    /// Stores the authoritative id read from the `id` column.
    fn assign_id(&mut self, id: Self::Id);
}

#[cfg(test)]
mod tests {
    use super::EntityKey;
    use rusqlite::types::{Value, ValueRef};
    use uuid::Uuid;

    #[test]
    fn uuid_key_parses_text_column() {
        let id = Uuid::new_v4();
        let text = id.to_string();
        let parsed = Uuid::from_sql_value(ValueRef::Text(text.as_bytes())).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_sql_value(), Value::Text(text));
    }

    #[test]
    fn integer_key_rejects_text_column() {
        let err = i64::from_sql_value(ValueRef::Text(b"abc")).unwrap_err();
        assert!(err.contains("integer"));
        assert_eq!(i64::from_sql_value(ValueRef::Integer(7)).unwrap(), 7);
    }

    #[test]
    fn uuid_key_reports_malformed_text() {
        let err = Uuid::from_sql_value(ValueRef::Text(b"not-a-uuid")).unwrap_err();
        assert!(err.contains("not-a-uuid"));
    }
}
