#![allow(dead_code)]

use docstore_core::{create_document_table, open_db_in_memory, Entity, IdKind, TableSpec};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    pub name: String,
    pub quantity: i64,
}

impl Widget {
    pub fn new(id: impl Into<String>, name: impl Into<String>, quantity: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            quantity,
        }
    }
}

impl Entity for Widget {
    type Id = String;

    fn id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Entity stored in a table with database-generated integer ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(skip)]
    pub id: Option<i64>,
    pub title: String,
}

impl Entity for Ticket {
    type Id = i64;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }
}

pub fn widgets_spec() -> TableSpec {
    TableSpec::new("widgets", IdKind::Text).unwrap()
}

pub fn tickets_spec() -> TableSpec {
    TableSpec::new("tickets", IdKind::Generated).unwrap()
}

pub fn setup_db() -> Connection {
    let conn = open_db_in_memory().unwrap();
    create_document_table(&conn, &widgets_spec()).unwrap();
    create_document_table(&conn, &tickets_spec()).unwrap();
    conn
}

pub fn widgets(count: usize) -> Vec<Widget> {
    (0..count)
        .map(|index| Widget::new(format!("w-{index:04}"), format!("widget {index}"), index as i64))
        .collect()
}

pub fn row_count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}

/// Aborts inserts of documents whose name is `poison`.
pub fn install_poison_trigger(conn: &Connection) {
    conn.execute_batch(
        "CREATE TRIGGER widgets_poison
         BEFORE INSERT ON widgets
         WHEN json_extract(NEW.document, '$.name') = 'poison'
         BEGIN
             SELECT RAISE(ABORT, 'poisoned widget');
         END;",
    )
    .unwrap();
}
