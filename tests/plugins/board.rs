use boardstack::core::db;
use boardstack::core::error::BoardstackError;
use boardstack::core::schemas;
use boardstack::core::store::Store;
use boardstack::plugins::board::{
    BoardStore, CardUpdate, Labels, NewBoard, NewCard, NewUser, Priority, Role, hash_password,
};
use tempfile::tempdir;

fn new_user(email: &str, username: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        username: username.to_string(),
        full_name: None,
        hashed_password: hash_password("pw").unwrap(),
        is_superuser: false,
    }
}

fn open(dir: &std::path::Path) -> BoardStore {
    BoardStore::open(&Store::new(dir)).expect("open store")
}

#[test]
fn user_emails_and_usernames_are_unique() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    boards.create_user(&new_user("a@x.io", "alice")).unwrap();
    let dup_email = boards.create_user(&new_user("a@x.io", "alice2")).unwrap_err();
    assert!(dup_email.is_constraint(), "{dup_email}");
    let dup_name = boards.create_user(&new_user("b@x.io", "alice")).unwrap_err();
    assert!(dup_name.is_constraint(), "{dup_name}");

    assert_eq!(boards.list_users(false).unwrap().len(), 1);
}

#[test]
fn invalid_values_never_reach_the_store() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let err = boards.create_user(&new_user("not-an-email", "bob")).unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));

    let owner = boards.create_user(&new_user("o@x.io", "owner")).unwrap();
    let err = boards
        .create_board(&NewBoard {
            title: "B".into(),
            owner_id: owner.id.clone(),
            background_color: Some("red".into()),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));
    assert!(boards.list_boards(None).unwrap().is_empty());
}

#[test]
fn deleting_a_user_cascades_to_boards_lists_and_cards() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let owner = boards.create_user(&new_user("owner@x.io", "owner")).unwrap();
    let other = boards.create_user(&new_user("other@x.io", "other")).unwrap();
    let board = boards
        .create_board(&NewBoard {
            title: "Roadmap".into(),
            owner_id: owner.id.clone(),
            ..Default::default()
        })
        .unwrap();
    boards.add_member(&board.id, &other.id, Role::Member).unwrap();
    let list = boards.create_list(&board.id, "To Do", None).unwrap();
    let card = boards
        .create_card(&NewCard {
            title: "Ship it".into(),
            list_id: list.id.clone(),
            ..Default::default()
        })
        .unwrap();
    boards.assign_card(&card.id, &other.id).unwrap();

    boards.delete_user(&owner.id).unwrap();

    assert!(boards.list_boards(None).unwrap().is_empty());
    assert!(boards.list_lists(&board.id).unwrap().is_empty());
    assert!(boards.get_card(&card.id).unwrap().is_none());

    let conn = db::db_connect(&Store::new(tmp.path()).board_db().to_string_lossy()).unwrap();
    for table in ["board_members", "card_assignments"] {
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0, "{table} should be empty after cascade");
    }
    assert!(boards.get_user_by_email("other@x.io").unwrap().is_some());
}

#[test]
fn duplicate_membership_is_rejected() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let owner = boards.create_user(&new_user("owner@x.io", "owner")).unwrap();
    let member = boards.create_user(&new_user("m@x.io", "member")).unwrap();
    let board = boards
        .create_board(&NewBoard {
            title: "Team".into(),
            owner_id: owner.id.clone(),
            ..Default::default()
        })
        .unwrap();

    // The owner row exists from creation.
    let err = boards.add_member(&board.id, &owner.id, Role::Admin).unwrap_err();
    assert!(err.is_constraint());

    boards.add_member(&board.id, &member.id, Role::Viewer).unwrap();
    let err = boards.add_member(&board.id, &member.id, Role::Member).unwrap_err();
    assert!(err.is_constraint());

    let members = boards.list_members(&board.id).unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|m| m.user_id == owner.id && m.role == Role::Owner));
}

#[test]
fn duplicate_assignment_is_rejected() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let owner = boards.create_user(&new_user("owner@x.io", "owner")).unwrap();
    let board = boards
        .create_board(&NewBoard {
            title: "B".into(),
            owner_id: owner.id.clone(),
            ..Default::default()
        })
        .unwrap();
    let list = boards.create_list(&board.id, "L", None).unwrap();
    let card = boards
        .create_card(&NewCard {
            title: "C".into(),
            list_id: list.id.clone(),
            ..Default::default()
        })
        .unwrap();

    boards.assign_card(&card.id, &owner.id).unwrap();
    assert!(boards.assign_card(&card.id, &owner.id).unwrap_err().is_constraint());
}

#[test]
fn updated_at_is_maintained_by_the_store() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path());
    let boards = BoardStore::open(&store).unwrap();

    let owner = boards.create_user(&new_user("owner@x.io", "owner")).unwrap();
    let board = boards
        .create_board(&NewBoard {
            title: "Before".into(),
            owner_id: owner.id.clone(),
            ..Default::default()
        })
        .unwrap();

    // A write that supplies its own timestamp is stamped over all the same.
    let conn = db::db_connect(&store.board_db().to_string_lossy()).unwrap();
    for table in ["users", "boards"] {
        conn.execute(
            &format!(
                "UPDATE {} SET updated_at = '1999-01-01T00:00:00.000Z' WHERE id = ?1",
                table
            ),
            [if table == "users" { &owner.id } else { &board.id }],
        )
        .unwrap();
    }
    drop(conn);

    let user = boards.get_user_by_email("owner@x.io").unwrap().unwrap();
    assert_ne!(user.updated_at, "1999-01-01T00:00:00.000Z");
    assert!(user.updated_at >= owner.updated_at);

    let renamed = boards.rename_board(&board.id, "After").unwrap();
    assert_eq!(renamed.title, "After");
    assert_ne!(renamed.updated_at, "1999-01-01T00:00:00.000Z");
    assert!(renamed.updated_at >= board.updated_at);
    assert_eq!(renamed.created_at, board.created_at);
}

#[test]
fn older_schema_triggers_are_replaced_on_upgrade() {
    let tmp = tempdir().unwrap();
    let conn = db::db_connect(&tmp.path().join("board.db").to_string_lossy()).unwrap();
    conn.execute_batch(&schemas::sqlite_schema()).unwrap();
    conn.execute_batch(
        "DROP TRIGGER trg_users_updated_at;
         CREATE TRIGGER trg_users_updated_at AFTER UPDATE ON users
         FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
         BEGIN
             UPDATE users SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
         END;
         PRAGMA user_version = 1;",
    )
    .unwrap();

    db::apply_schema(&conn).unwrap();
    assert_eq!(db::schema_version(&conn).unwrap(), schemas::BOARD_SCHEMA_VERSION);
    let sql: String = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE name = 'trg_users_updated_at'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!(!sql.contains("WHEN"), "{sql}");
}

#[test]
fn cards_keep_priority_labels_and_move_between_lists() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let owner = boards.create_user(&new_user("owner@x.io", "owner")).unwrap();
    let board = boards
        .create_board(&NewBoard {
            title: "Flow".into(),
            owner_id: owner.id.clone(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(board.background_color, "#0079bf");

    let todo = boards.create_list(&board.id, "To Do", None).unwrap();
    let done = boards.create_list(&board.id, "Done", None).unwrap();
    assert_eq!((todo.position, done.position), (0, 1));

    let mut ids = Vec::new();
    for title in ["a", "b", "c"] {
        let card = boards
            .create_card(&NewCard {
                title: title.into(),
                list_id: todo.id.clone(),
                priority: Priority::High,
                labels: Labels::new(["bug", "ui"]).unwrap(),
                ..Default::default()
            })
            .unwrap();
        ids.push(card.id);
    }

    let first = boards.get_card(&ids[0]).unwrap().unwrap();
    assert_eq!(first.priority, Priority::High);
    assert_eq!(first.labels.as_slice(), ["bug", "ui"]);

    let moved = boards.move_card(&ids[0], &done.id, 5).unwrap();
    assert_eq!(moved.list_id, done.id);
    assert_eq!(moved.position, 0);

    let remaining: Vec<(String, i64)> = boards
        .list_cards(&todo.id)
        .unwrap()
        .into_iter()
        .map(|c| (c.title, c.position))
        .collect();
    assert_eq!(remaining, vec![("b".to_string(), 0), ("c".to_string(), 1)]);

    let updated = boards
        .update_card(
            &ids[1],
            &CardUpdate {
                priority: Some(Priority::Urgent),
                due_date: Some("2030-01-15".into()),
                labels: Some(Labels::default()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.priority, Priority::Urgent);
    assert_eq!(updated.due_date.as_deref(), Some("2030-01-15"));
    assert!(updated.labels.is_empty());
    assert_eq!(updated.title, "b");

    let err = boards.update_card(&ids[1], &CardUpdate::default()).unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));

    let described = boards
        .update_card(
            &ids[1],
            &CardUpdate {
                description: Some("details".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(described.description.as_deref(), Some("details"));
    let cleared = boards
        .update_card(
            &ids[1],
            &CardUpdate {
                clear_description: true,
                clear_due_date: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(cleared.description, None);
    assert_eq!(cleared.due_date, None);
    assert_eq!(cleared.priority, Priority::Urgent);

    let err = boards
        .update_card(
            &ids[1],
            &CardUpdate {
                description: Some("x".into()),
                clear_description: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));

    let summary = boards.board_summary(&board.id).unwrap();
    assert_eq!((summary.lists, summary.cards, summary.members), (2, 3, 1));
}

#[test]
fn missing_rows_are_not_found() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    assert!(matches!(
        boards.delete_user("nope").unwrap_err(),
        BoardstackError::NotFound(_)
    ));
    assert!(matches!(
        boards.rename_board("nope", "x").unwrap_err(),
        BoardstackError::NotFound(_)
    ));
    assert!(matches!(
        boards.move_card("nope", "nope", 0).unwrap_err(),
        BoardstackError::NotFound(_)
    ));
    assert!(matches!(
        boards.board_summary("nope").unwrap_err(),
        BoardstackError::NotFound(_)
    ));
}

#[test]
fn deactivated_users_drop_out_of_active_listing() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path());

    let a = boards.create_user(&new_user("a@x.io", "alice")).unwrap();
    boards.create_user(&new_user("b@x.io", "bob")).unwrap();

    let deactivated = boards.deactivate_user(&a.id).unwrap();
    assert!(!deactivated.is_active);
    assert_eq!(boards.list_users(true).unwrap().len(), 1);
    assert_eq!(boards.list_users(false).unwrap().len(), 2);
}

#[test]
fn store_operations_are_audited() {
    let tmp = tempdir().unwrap();
    let boards = open(tmp.path()).with_actor("tester");
    boards.create_user(&new_user("a@x.io", "alice")).unwrap();
    let _ = boards.create_user(&new_user("a@x.io", "alice"));

    let events = boardstack::core::broker::read_audit_log(tmp.path()).unwrap();
    let creates: Vec<_> = events
        .iter()
        .filter(|e| e.op == "board.user.create" && e.actor == "tester")
        .collect();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].status, "success");
    assert_eq!(creates[1].status, "error");
    assert!(creates[1].error.is_some());
}
