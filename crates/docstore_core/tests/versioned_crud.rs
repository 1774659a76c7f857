mod common;

use common::{setup_db, tickets_spec, widgets_spec, Ticket, Widget};
use docstore_core::{
    create_document_table, open_db, with_transaction, ConflictReason, DocumentRepository,
    FailureKind, RepoError, SqliteDocumentRepository, INITIAL_VERSION,
};
use std::sync::Barrier;

#[test]
fn create_stores_initial_version_and_equal_timestamps() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    let created = repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    assert_eq!(created.version, INITIAL_VERSION);
    assert_eq!(created.created_at, created.modified_at);

    let loaded = repo.get(&"w-1".to_string(), false).unwrap().unwrap();
    assert_eq!(loaded, created);
}

#[test]
fn update_bumps_version_and_modified_at_but_keeps_created_at() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    let created = repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    let mut current = created.clone();
    for round in 1..=3 {
        let mut next = current.item.clone();
        next.quantity += 1;
        let updated = repo.update(next, current.version).unwrap();

        assert_eq!(updated.version, current.version + 1, "round {round}");
        assert!(updated.modified_at > current.modified_at, "round {round}");
        assert_eq!(updated.created_at, created.created_at, "round {round}");
        current = updated;
    }

    let stored = repo.get_or_err(&"w-1".to_string(), false).unwrap();
    assert_eq!(stored.version, 4);
    assert_eq!(stored.item.quantity, 6);
}

#[test]
fn update_with_stale_version_is_a_conflict_and_changes_nothing() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    repo.update(Widget::new("w-1", "bolt", 4), 1).unwrap();

    let err = repo.update(Widget::new("w-1", "nut", 99), 1).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Conflict);
    let conflict = err.conflict().unwrap();
    assert_eq!(conflict.reason, ConflictReason::VersionMismatch);
    assert_eq!(conflict.table.as_deref(), Some("widgets"));
    assert_eq!(conflict.id.as_deref(), Some("w-1"));
    assert_eq!(conflict.expected_version, Some(1));

    let stored = repo.get_or_err(&"w-1".to_string(), false).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.item.name, "bolt");
}

#[test]
fn update_of_missing_row_is_the_same_conflict_as_a_stale_version() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    let err = repo.update(Widget::new("ghost", "none", 0), 1).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        err.conflict().unwrap().reason,
        ConflictReason::VersionMismatch
    );
}

#[test]
fn delete_requires_matching_version() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();
    let id = "w-1".to_string();

    repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    repo.update(Widget::new("w-1", "bolt", 4), 1).unwrap();

    let stale = repo.delete(&id, 1).unwrap_err();
    assert!(stale.is_conflict());
    assert!(repo.exists(&id).unwrap());

    repo.delete(&id, 2).unwrap();
    assert!(!repo.exists(&id).unwrap());
    assert!(repo.get(&id, false).unwrap().is_none());
}

#[test]
fn delete_of_never_created_id_is_a_conflict() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    let err = repo.delete(&"never".to_string(), 1).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Conflict);
    assert!(!err.is_retryable());
}

#[test]
fn get_or_err_reports_not_found() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    let err = repo.get_or_err(&"missing".to_string(), false).unwrap_err();
    assert_eq!(err.kind(), FailureKind::NotFound);
    match err {
        RepoError::NotFound { table, id } => {
            assert_eq!(table, "widgets");
            assert_eq!(id, "missing");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn duplicate_create_is_a_key_conflict_with_context() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();

    repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    let err = repo.create(Widget::new("w-1", "other", 9)).unwrap_err();

    let conflict = err.conflict().unwrap();
    assert_eq!(conflict.reason, ConflictReason::DuplicateKey);
    assert_eq!(conflict.table.as_deref(), Some("widgets"));
    assert_eq!(conflict.id.as_deref(), Some("w-1"));
    assert!(conn.is_autocommit());

    let stored = repo.get_or_err(&"w-1".to_string(), false).unwrap();
    assert_eq!(stored.item.name, "bolt");
}

#[test]
fn generated_ids_are_assigned_on_create() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Ticket>::try_new(&conn, tickets_spec()).unwrap();

    let first = repo
        .create(Ticket {
            id: None,
            title: "first".to_string(),
        })
        .unwrap();
    let second = repo
        .create(Ticket {
            id: None,
            title: "second".to_string(),
        })
        .unwrap();

    let first_id = first.item.id.unwrap();
    let second_id = second.item.id.unwrap();
    assert!(second_id > first_id);

    let loaded = repo.get_or_err(&second_id, false).unwrap();
    assert_eq!(loaded.item.id, Some(second_id));
    assert_eq!(loaded.item.title, "second");
}

#[test]
fn text_id_table_rejects_entity_without_id() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Ticket>::try_new(
        &conn,
        docstore_core::TableSpec::new("widgets", docstore_core::IdKind::Text).unwrap(),
    )
    .unwrap();

    let err = repo
        .create(Ticket {
            id: None,
            title: "orphan".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidData(_)));
}

#[test]
fn get_for_update_needs_an_active_transaction() {
    let conn = setup_db();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();
    repo.create(Widget::new("w-1", "bolt", 3)).unwrap();
    let id = "w-1".to_string();

    let err = repo.get(&id, true).unwrap_err();
    assert!(matches!(err, RepoError::TransactionRequired(_)));

    let locked = with_transaction(&conn, |_| repo.get_or_err(&id, true)).unwrap();
    assert_eq!(locked.version, 1);
}

#[test]
fn repository_requires_document_table() {
    let conn = setup_db();
    let err = SqliteDocumentRepository::<Widget>::try_new(
        &conn,
        docstore_core::TableSpec::new("missing_table", docstore_core::IdKind::Text).unwrap(),
    )
    .err()
    .unwrap();
    assert_eq!(err.kind(), FailureKind::Unknown);
}

#[test]
fn concurrent_updates_from_same_version_let_exactly_one_win() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("concurrency.sqlite3");

    {
        let conn = open_db(&db_path).unwrap();
        create_document_table(&conn, &widgets_spec()).unwrap();
        let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();
        repo.create(Widget::new("w-1", "bolt", 0)).unwrap();
    }

    let barrier = Barrier::new(2);
    let outcomes: Vec<Result<i64, RepoError>> = std::thread::scope(|scope| {
        let workers: Vec<_> = [10, 20]
            .into_iter()
            .map(|quantity| {
                let barrier = &barrier;
                let db_path = &db_path;
                scope.spawn(move || {
                    let conn = open_db(db_path).unwrap();
                    let repo =
                        SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec())
                            .unwrap();
                    barrier.wait();
                    repo.update(Widget::new("w-1", "bolt", quantity), 1)
                        .map(|updated| updated.item.quantity)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    let winners: Vec<i64> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().ok().copied())
        .collect();
    let losers: Vec<&RepoError> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().err())
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);
    assert_eq!(losers[0].kind(), FailureKind::Conflict);

    let conn = open_db(&db_path).unwrap();
    let repo = SqliteDocumentRepository::<Widget>::try_new(&conn, widgets_spec()).unwrap();
    let stored = repo.get_or_err(&"w-1".to_string(), false).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.item.quantity, winners[0]);
}
