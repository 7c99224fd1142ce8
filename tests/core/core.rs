use boardstack::core::assets;
use boardstack::core::broker::{self, DbBroker};
use boardstack::core::config::{self, BoardstackConfig, CONFIG_FILE, Project};
use boardstack::core::db;
use boardstack::core::env::EnvContext;
use boardstack::core::error::BoardstackError;
use boardstack::core::schemas;
use boardstack::core::store::{STORE_ENV, Store};
use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn run_boardstack(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_boardstack"))
        .args(args)
        .current_dir(dir)
        .env_remove(STORE_ENV)
        .output()
        .expect("run boardstack")
}

fn stdout_json(out: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&out.stdout)
        )
    })
}

#[test]
fn embedded_templates_resolve() {
    let names = assets::list_templates();
    assert_eq!(names, ["boardstack.toml", "env.example"]);
    for name in names {
        let content = assets::get_template(name).expect("listed template");
        assert!(!content.trim().is_empty());
    }
    assert!(assets::get_template("nginx.conf").is_none());

    let tmp = tempdir().expect("tempdir");
    config::write_default_config(tmp.path(), false).unwrap();
    assert_eq!(config::template_target("boardstack.toml"), CONFIG_FILE);
    for name in assets::list_templates() {
        let written = fs::read_to_string(tmp.path().join(config::template_target(name))).unwrap();
        assert_eq!(Some(written.as_str()), assets::get_template(name));
    }
}

#[test]
fn board_schema_has_expected_objects_and_is_idempotent() {
    let tmp = tempdir().expect("tempdir");
    db::initialize_board_db(tmp.path()).unwrap();
    db::initialize_board_db(tmp.path()).unwrap();

    let conn = db::db_connect(&db::board_db_path(tmp.path()).to_string_lossy()).unwrap();
    let counts = db::inspect_schema(&conn).unwrap();
    assert_eq!(counts.version, schemas::BOARD_SCHEMA_VERSION);

    let mut tables = schemas::TABLES.to_vec();
    tables.sort();
    assert_eq!(counts.tables, tables);
    let mut indexes = schemas::INDEXES.to_vec();
    indexes.sort();
    assert_eq!(counts.indexes, indexes);
    assert_eq!(counts.triggers.len(), 4);

    // Both init runs are on the audit trail.
    let inits = broker::read_audit_log(tmp.path())
        .unwrap()
        .into_iter()
        .filter(|e| e.op == "schema.init")
        .count();
    assert_eq!(inits, 2);
}

#[test]
fn postgres_init_sql_declares_every_object() {
    let sql = schemas::POSTGRES_INIT_SQL;
    for table in schemas::TABLES {
        assert!(
            sql.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)),
            "{table}"
        );
    }
    for index in schemas::INDEXES {
        assert!(sql.contains(index), "{index}");
    }
    let objects = schemas::postgres_trigger_objects();
    assert_eq!(objects.len(), 5);
    for name in &objects {
        assert!(sql.contains(name.as_str()), "{name}");
    }
    assert!(sql.contains("ON DELETE CASCADE"));
}

#[test]
fn broker_records_success_and_failure() {
    let tmp = tempdir().expect("tempdir");
    let broker = DbBroker::new(tmp.path());
    let db_path = tmp.path().join("scratch.db");

    let answer: i64 = broker
        .with_conn(&db_path, "tester", "scratch.read", |conn| {
            Ok(conn.query_row("SELECT 41 + 1", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(answer, 42);

    let err = broker
        .with_conn(&db_path, "tester", "scratch.fail", |conn| {
            conn.execute("INSERT INTO missing_table VALUES (1)", [])?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, BoardstackError::RusqliteError(_)));

    let events = broker::read_audit_log(tmp.path()).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].op, "scratch.read");
    assert_eq!(events[0].status, "success");
    assert_eq!(events[0].db_id, "scratch.db");
    assert_eq!(events[1].status, "error");
    assert!(events[1].error.as_deref().unwrap_or("").contains("missing_table"));
}

#[test]
fn env_file_values_feed_substitution() {
    let tmp = tempdir().expect("tempdir");
    let env_path = tmp.path().join(".env");
    fs::write(
        &env_path,
        "BOARDSTACK_TEST_ONLY_DB=kanban\nBOARDSTACK_TEST_ONLY_EMPTY=\n",
    )
    .unwrap();

    let env = EnvContext::load(&env_path).unwrap();
    assert_eq!(
        env.substitute("postgres://${BOARDSTACK_TEST_ONLY_DB}").unwrap(),
        "postgres://kanban"
    );
    assert_eq!(
        env.substitute("${BOARDSTACK_TEST_ONLY_EMPTY:-5432}").unwrap(),
        "5432"
    );
    assert!(env.substitute("${BOARDSTACK_TEST_ONLY_UNSET}").is_err());

    // A missing env file is an empty one.
    assert!(EnvContext::load(&tmp.path().join("absent.env")).is_ok());
}

#[test]
fn project_root_is_found_from_nested_dirs() {
    let tmp = tempdir().expect("tempdir");
    let nested = tmp.path().join("a/b/c");
    fs::create_dir_all(&nested).unwrap();
    assert!(matches!(
        config::find_project_root(&nested).unwrap_err(),
        BoardstackError::NotFound(_)
    ));

    config::write_default_config(tmp.path(), false).unwrap();
    assert_eq!(config::find_project_root(&nested).unwrap(), tmp.path());

    let project = Project::load(tmp.path()).unwrap();
    assert_eq!(project.config.stack.name, "boardstack");
    assert_eq!(project.compose_path(), tmp.path().join("docker-compose.yml"));
    assert_eq!(project.backups_dir(), tmp.path().join(".boardstack/backups"));
}

#[test]
fn default_config_is_not_overwritten_without_force() {
    let tmp = tempdir().expect("tempdir");
    let written = config::write_default_config(tmp.path(), false).unwrap();
    assert_eq!(written.len(), 2);

    fs::write(tmp.path().join(CONFIG_FILE), "[stack]\nname = \"custom\"\n").unwrap();
    assert!(config::write_default_config(tmp.path(), false).unwrap().is_empty());
    assert_eq!(Project::load(tmp.path()).unwrap().config.stack.name, "custom");

    let written = config::write_default_config(tmp.path(), true).unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(Project::load(tmp.path()).unwrap().config.stack.name, "boardstack");
}

#[test]
fn malformed_descriptor_is_a_toml_error() {
    let err = BoardstackConfig::from_toml("[stack\nname = 1").unwrap_err();
    assert!(matches!(err, BoardstackError::TomlError(_)));
}

#[test]
fn store_paths_live_under_the_root() {
    let store = Store::new("/tmp/bs");
    assert!(store.board_db().ends_with("board.db"));
    assert!(store.cache_db().ends_with("cache.db"));
    assert!(store.audit_log().ends_with("broker.events.jsonl"));
}

#[test]
fn cli_version_and_schema_render() {
    let tmp = tempdir().expect("tempdir");
    let out = run_boardstack(tmp.path(), &["version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with('v'));

    let out = run_boardstack(tmp.path(), &["schema", "render", "--dialect", "sqlite"]);
    assert!(out.status.success());
    let ddl = String::from_utf8_lossy(&out.stdout);
    assert!(ddl.contains("CREATE TABLE IF NOT EXISTS card_assignments"));
    assert!(ddl.contains("CREATE TRIGGER"));

    let out = run_boardstack(tmp.path(), &["schema", "render"]);
    assert!(String::from_utf8_lossy(&out.stdout).contains("update_updated_at_column"));
}

#[test]
fn cli_commands_outside_a_project_fail_cleanly() {
    let tmp = tempdir().expect("tempdir");
    let out = run_boardstack(tmp.path(), &["stack", "validate"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("boardstack init"));
}

#[test]
fn cli_init_then_validate_seed_and_smoke() {
    let tmp = tempdir().expect("tempdir");

    let out = run_boardstack(tmp.path(), &["init"]);
    assert!(
        out.status.success(),
        "init failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let envelope = stdout_json(&out);
    assert_eq!(envelope["cmd"], "init");
    assert!(tmp.path().join(CONFIG_FILE).exists());
    assert!(tmp.path().join(".env.example").exists());
    assert!(tmp.path().join(".boardstack/data/board.db").exists());

    let out = run_boardstack(tmp.path(), &["stack", "validate"]);
    assert!(
        out.status.success(),
        "validate failed: {}",
        String::from_utf8_lossy(&out.stdout)
    );
    assert_eq!(stdout_json(&out)["status"], "ok");

    let out = run_boardstack(tmp.path(), &["seed", "--users", "2", "--boards", "2"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout_json(&out)["summary"]["boards_created"], 2);

    let verify = |password: &str| {
        let args = [
            "board",
            "user",
            "verify",
            "admin@boardstack.local",
            "--password",
            password,
        ];
        stdout_json(&run_boardstack(tmp.path(), &args))["valid"].clone()
    };
    assert_eq!(verify("admin123"), true);
    assert_eq!(verify("wrong"), false);

    let out = run_boardstack(tmp.path(), &["smoke", "--target", "local", "--settle", "0"]);
    assert!(
        out.status.success(),
        "smoke failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let report = stdout_json(&out);
    assert_eq!(report["status"], "ok");
    assert_eq!(report["report"]["passed"], true);

    let out = run_boardstack(tmp.path(), &["audit", "--tail", "3"]);
    assert!(out.status.success());
    assert_eq!(stdout_json(&out)["events"].as_array().map(Vec::len), Some(3));
}

#[test]
fn cli_store_location_honours_env_override() {
    let tmp = tempdir().expect("tempdir");
    let elsewhere = tempdir().expect("tempdir");
    config::write_default_config(tmp.path(), false).unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_boardstack"))
        .args(["schema", "apply"])
        .current_dir(tmp.path())
        .env(STORE_ENV, elsewhere.path())
        .output()
        .expect("run boardstack");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(elsewhere.path().join("board.db").exists());
    assert!(!tmp.path().join(".boardstack/data/board.db").exists());
}
