use boardstack::core::error::BoardstackError;
use boardstack::core::store::Store;
use boardstack::plugins::backup::{
    self, BackupMetadata, BackupTarget, METADATA_FILE, POSTGRES_DUMP_FILE, SqlDumper,
    create_backup, create_sql_backup, list_backups, restore_backup, restore_sql_backup,
};
use boardstack::plugins::board::{BoardStore, NewUser, hash_password};
use boardstack::plugins::compose::PostgresLogin;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn add_user(boards: &BoardStore, email: &str, username: &str) {
    boards
        .create_user(&NewUser {
            email: email.to_string(),
            username: username.to_string(),
            full_name: None,
            hashed_password: hash_password("pw").unwrap(),
            is_superuser: false,
        })
        .unwrap();
}

fn set_created_at(backups: &Path, name: &str, created_at: &str) {
    let path = backups.join(name).join(METADATA_FILE);
    let mut metadata: BackupMetadata =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    metadata.created_at = created_at.to_string();
    fs::write(&path, serde_json::to_string_pretty(&metadata).unwrap()).unwrap();
}

#[test]
fn restore_brings_back_the_snapshot_contents() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");
    let boards = BoardStore::open(&store).unwrap();
    add_user(&boards, "keep@x.io", "keeper");

    let metadata = create_backup(&store, &backups, Some("before_change")).unwrap();
    assert_eq!(metadata.backup_name, "before_change");
    assert_eq!(metadata.sha256.len(), 64);
    assert_eq!(
        metadata.sha256,
        backup::file_sha256(&backups.join("before_change/board.db")).unwrap()
    );

    add_user(&boards, "later@x.io", "later");
    assert_eq!(boards.list_users(false).unwrap().len(), 2);

    restore_backup(&store, &backups, "before_change").unwrap();
    let users = BoardStore::open(&store).unwrap().list_users(false).unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].email, "keep@x.io");
}

#[test]
fn tampered_snapshot_is_refused_and_live_store_untouched() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");
    let boards = BoardStore::open(&store).unwrap();
    add_user(&boards, "a@x.io", "alice");

    create_backup(&store, &backups, Some("snap")).unwrap();
    add_user(&boards, "b@x.io", "bobby");

    let snapshot = backups.join("snap/board.db");
    let mut bytes = fs::read(&snapshot).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&snapshot, bytes).unwrap();

    let err = restore_backup(&store, &backups, "snap").unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));
    assert!(err.to_string().contains("corrupt"), "{err}");
    assert_eq!(boards.list_users(false).unwrap().len(), 2);
}

#[test]
fn names_are_unique_and_safe() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");
    BoardStore::open(&store).unwrap();

    create_backup(&store, &backups, Some("nightly")).unwrap();
    let err = create_backup(&store, &backups, Some("nightly")).unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");

    let err = create_backup(&store, &backups, Some("../escape")).unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));
}

#[test]
fn missing_store_or_metadata_is_not_found() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");

    let err = create_backup(&store, &backups, None).unwrap_err();
    assert!(matches!(err, BoardstackError::NotFound(_)));

    fs::create_dir_all(backups.join("stray")).unwrap();
    let err = restore_backup(&store, &backups, "stray").unwrap_err();
    assert!(matches!(err, BoardstackError::NotFound(_)));
    let err = restore_backup(&store, &backups, "absent").unwrap_err();
    assert!(matches!(err, BoardstackError::NotFound(_)));
}

#[test]
fn listing_is_newest_first_and_skips_foreign_dirs() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");
    BoardStore::open(&store).unwrap();

    assert!(list_backups(&backups).unwrap().is_empty());

    for name in ["first", "second", "third"] {
        create_backup(&store, &backups, Some(name)).unwrap();
    }
    set_created_at(&backups, "first", "1700000000Z");
    set_created_at(&backups, "second", "1700000300Z");
    set_created_at(&backups, "third", "1700000100Z");
    fs::create_dir_all(backups.join("not_a_backup")).unwrap();

    let names: Vec<String> = list_backups(&backups)
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, ["second", "third", "first"]);
}

#[test]
fn default_names_carry_the_epoch() {
    let name = backup::default_backup_name();
    let suffix = name.strip_prefix("boardstack_backup_").unwrap();
    assert!(suffix.parse::<u64>().is_ok(), "{name}");
}

/// Database stand-in: hands out a fixed dump and records every load.
struct FakeDatabase {
    dump: Vec<u8>,
    loaded: RefCell<Vec<Vec<u8>>>,
}

impl FakeDatabase {
    fn new(dump: &str) -> Self {
        Self {
            dump: dump.as_bytes().to_vec(),
            loaded: RefCell::new(Vec::new()),
        }
    }
}

impl SqlDumper for FakeDatabase {
    fn dump(&self) -> Result<Vec<u8>, BoardstackError> {
        Ok(self.dump.clone())
    }

    fn load(&self, script: &[u8]) -> Result<(), BoardstackError> {
        self.loaded.borrow_mut().push(script.to_vec());
        Ok(())
    }
}

const DUMP: &str = "DROP TABLE IF EXISTS users;\nCREATE TABLE users (id varchar(26));\n";

#[test]
fn database_dump_round_trips_through_the_same_envelope() {
    let tmp = tempdir().unwrap();
    let backups = tmp.path().join("backups");
    let db = FakeDatabase::new(DUMP);

    let metadata = create_sql_backup(&db, &backups, Some("stack_nightly")).unwrap();
    assert_eq!(metadata.target, BackupTarget::Docker);
    assert_eq!(metadata.database, POSTGRES_DUMP_FILE);
    let dump_path = backups.join("stack_nightly").join(POSTGRES_DUMP_FILE);
    assert_eq!(fs::read_to_string(&dump_path).unwrap(), DUMP);
    assert_eq!(metadata.sha256, backup::file_sha256(&dump_path).unwrap());

    restore_sql_backup(&db, &backups, "stack_nightly").unwrap();
    assert_eq!(db.loaded.borrow().as_slice(), [DUMP.as_bytes().to_vec()]);

    let listed = list_backups(&backups).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].target, BackupTarget::Docker);
}

#[test]
fn tampered_dump_is_never_loaded() {
    let tmp = tempdir().unwrap();
    let backups = tmp.path().join("backups");
    let db = FakeDatabase::new(DUMP);
    create_sql_backup(&db, &backups, Some("snap")).unwrap();

    fs::write(
        backups.join("snap").join(POSTGRES_DUMP_FILE),
        "DROP TABLE public.users;\n",
    )
    .unwrap();
    let err = restore_sql_backup(&db, &backups, "snap").unwrap_err();
    assert!(err.to_string().contains("corrupt"), "{err}");
    assert!(db.loaded.borrow().is_empty());
}

#[test]
fn snapshots_only_restore_into_the_target_they_came_from() {
    let tmp = tempdir().unwrap();
    let store = Store::new(tmp.path().join("store"));
    let backups = tmp.path().join("backups");
    BoardStore::open(&store).unwrap();
    let db = FakeDatabase::new(DUMP);

    create_sql_backup(&db, &backups, Some("from_stack")).unwrap();
    create_backup(&store, &backups, Some("from_local")).unwrap();

    let err = restore_backup(&store, &backups, "from_stack").unwrap_err();
    assert!(matches!(err, BoardstackError::ValidationError(_)));
    assert!(err.to_string().contains("docker target"), "{err}");
    assert!(restore_sql_backup(&db, &backups, "from_local").is_err());
    assert!(db.loaded.borrow().is_empty());
}

#[test]
fn empty_dump_leaves_no_backup_behind() {
    let tmp = tempdir().unwrap();
    let backups = tmp.path().join("backups");
    let err = create_sql_backup(&FakeDatabase::new("  \n"), &backups, Some("hollow")).unwrap_err();
    assert!(err.to_string().contains("empty"), "{err}");
    assert!(!backups.join("hollow").exists());
}

#[test]
fn metadata_without_a_target_reads_as_local() {
    let raw = r#"{
        "backup_name": "old",
        "created_at": "1700000000Z",
        "database": "board.db",
        "sha256": "00",
        "size_bytes": 0,
        "schema_version": 1,
        "format_version": "1.0"
    }"#;
    let metadata: BackupMetadata = serde_json::from_str(raw).unwrap();
    assert_eq!(metadata.target, BackupTarget::Local);
}

#[test]
fn client_tool_invocations() {
    let login = PostgresLogin {
        service: "postgres".into(),
        user: "kanban".into(),
        database: "board".into(),
    };
    let dump = backup::pg_dump_argv(&login);
    assert_eq!(dump[..5], ["pg_dump", "--username", "kanban", "--dbname", "board"]);
    for flag in ["--clean", "--if-exists", "--no-owner", "--no-privileges"] {
        assert!(dump.iter().any(|a| a == flag), "{flag}");
    }

    let restore = backup::psql_restore_argv(&login);
    assert_eq!(restore[0], "psql");
    assert!(restore.iter().any(|a| a == "--single-transaction"));
    assert!(restore.iter().any(|a| a == "ON_ERROR_STOP=1"));
    assert_eq!(restore[restore.len() - 2..], ["--file", "-"]);
}
