//! Snapshot and restore of the board store.
//!
//! A backup is a directory `<backups>/<name>/` holding one snapshot file and
//! `metadata.json` with the snapshot's sha256. Restore refuses to touch the
//! live data unless the hash matches.
//!
//! Two targets produce snapshots. `local` copies the SQLite store with
//! `VACUUM INTO`. `docker` dumps the running database service with
//! `pg_dump --clean` and restores by feeding the dump to `psql`.

use crate::core::broker::DbBroker;
use crate::core::config::Project;
use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::compose::{self, ComposeRunner, PostgresLogin};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";
pub const POSTGRES_DUMP_FILE: &str = "postgresql_dump.sql";
pub const BACKUP_FORMAT_VERSION: &str = "1.1";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupTarget {
    /// The SQLite store under `.boardstack/data`.
    #[default]
    Local,
    /// The running database service of the stack.
    Docker,
}

impl std::fmt::Display for BackupTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupTarget::Local => write!(f, "local"),
            BackupTarget::Docker => write!(f, "docker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupMetadata {
    pub backup_name: String,
    pub created_at: String,
    /// Backups written before targets existed are local.
    #[serde(default)]
    pub target: BackupTarget,
    /// Snapshot file name inside the backup directory.
    pub database: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub schema_version: i64,
    pub format_version: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub created_at: String,
    pub target: BackupTarget,
    pub size_bytes: u64,
    pub sha256: String,
}

pub fn default_backup_name() -> String {
    format!("boardstack_backup_{}", time::now_epoch_secs())
}

fn validate_backup_name(name: &str) -> Result<(), error::BoardstackError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        return Err(error::BoardstackError::ValidationError(format!(
            "backup name '{}' may only contain A-Z a-z 0-9 _ - .",
            name
        )));
    }
    Ok(())
}

pub fn file_sha256(path: &Path) -> Result<String, error::BoardstackError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn read_metadata(dir: &Path) -> Result<BackupMetadata, error::BoardstackError> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Err(error::BoardstackError::NotFound(format!(
            "{} (not a backup directory)",
            path.display()
        )));
    }
    Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
}

fn epoch_of(created_at: &str) -> u64 {
    created_at.trim_end_matches('Z').parse().unwrap_or(0)
}

/// Validates `name` (or picks the default) and claims `<backups_dir>/<name>/`.
fn claim_backup_dir(
    backups_dir: &Path,
    name: Option<&str>,
) -> Result<(String, PathBuf), error::BoardstackError> {
    let name = name.map(str::to_string).unwrap_or_else(default_backup_name);
    validate_backup_name(&name)?;
    let dir = backups_dir.join(&name);
    if dir.exists() {
        return Err(error::BoardstackError::ValidationError(format!(
            "backup '{}' already exists",
            name
        )));
    }
    fs::create_dir_all(&dir)?;
    Ok((name, dir))
}

fn seal_backup(
    dir: &Path,
    name: String,
    target: BackupTarget,
    snapshot_file: &str,
    schema_version: i64,
) -> Result<BackupMetadata, error::BoardstackError> {
    let snapshot = dir.join(snapshot_file);
    let metadata = BackupMetadata {
        backup_name: name,
        created_at: time::now_epoch_z(),
        target,
        database: snapshot_file.to_string(),
        sha256: file_sha256(&snapshot)?,
        size_bytes: fs::metadata(&snapshot)?.len(),
        schema_version,
        format_version: BACKUP_FORMAT_VERSION.to_string(),
    };
    fs::write(
        dir.join(METADATA_FILE),
        serde_json::to_string_pretty(&metadata)?,
    )?;
    Ok(metadata)
}

/// Loads the named backup and checks it was taken from `target`, that its
/// snapshot is present and that the snapshot still hashes to the recorded
/// value.
fn verified_snapshot(
    backups_dir: &Path,
    name: &str,
    target: BackupTarget,
) -> Result<(BackupMetadata, PathBuf), error::BoardstackError> {
    validate_backup_name(name)?;
    let dir = backups_dir.join(name);
    if !dir.is_dir() {
        return Err(error::BoardstackError::NotFound(format!("backup '{}'", name)));
    }
    let metadata = read_metadata(&dir)?;
    if metadata.target != target {
        return Err(error::BoardstackError::ValidationError(format!(
            "backup '{}' was taken from the {} target, not {}",
            name, metadata.target, target
        )));
    }
    let snapshot = dir.join(&metadata.database);
    if !snapshot.exists() {
        return Err(error::BoardstackError::NotFound(format!(
            "backup '{}' is missing {}",
            name, metadata.database
        )));
    }

    let actual = file_sha256(&snapshot)?;
    if actual != metadata.sha256 {
        return Err(error::BoardstackError::ValidationError(format!(
            "backup '{}' is corrupt: sha256 {} does not match recorded {}",
            name, actual, metadata.sha256
        )));
    }
    if metadata.schema_version > schemas::BOARD_SCHEMA_VERSION {
        return Err(error::BoardstackError::ValidationError(format!(
            "backup '{}' has schema version {} (this build supports {})",
            name,
            metadata.schema_version,
            schemas::BOARD_SCHEMA_VERSION
        )));
    }
    Ok((metadata, snapshot))
}

/// Snapshots the live store into `<backups_dir>/<name>/`.
pub fn create_backup(
    store: &Store,
    backups_dir: &Path,
    name: Option<&str>,
) -> Result<BackupMetadata, error::BoardstackError> {
    if let Some(name) = name {
        validate_backup_name(name)?;
    }
    let live = store.board_db();
    if !live.exists() {
        return Err(error::BoardstackError::NotFound(format!(
            "no board store at {}",
            live.display()
        )));
    }

    let (name, dir) = claim_backup_dir(backups_dir, name)?;
    let snapshot = dir.join(schemas::BOARD_DB_NAME);

    let target = snapshot.to_string_lossy().to_string();
    let broker = DbBroker::new(&store.root);
    let schema_version = broker.with_conn(&live, "backup", "backup.create", |conn| {
        conn.execute("VACUUM INTO ?1", [target.as_str()])?;
        db::schema_version(conn)
    });
    let schema_version = match schema_version {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
    };

    seal_backup(
        &dir,
        name,
        BackupTarget::Local,
        schemas::BOARD_DB_NAME,
        schema_version,
    )
}

/// Replaces the live store with the named snapshot after verifying its hash.
pub fn restore_backup(
    store: &Store,
    backups_dir: &Path,
    name: &str,
) -> Result<BackupMetadata, error::BoardstackError> {
    let (metadata, snapshot) = verified_snapshot(backups_dir, name, BackupTarget::Local)?;

    fs::create_dir_all(&store.root)?;
    let live = store.board_db();
    let staged = live.with_extension("db.restore");
    fs::copy(&snapshot, &staged)?;
    for suffix in ["-wal", "-shm"] {
        let side = sidecar(&live, suffix);
        if side.exists() {
            fs::remove_file(&side)?;
        }
    }
    fs::rename(&staged, &live)?;

    let broker = DbBroker::new(&store.root);
    broker.with_conn(&live, "backup", "backup.restore", |conn| {
        let check: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(error::BoardstackError::DatabaseInitializationError(format!(
                "restored store failed integrity check: {}",
                check
            )));
        }
        Ok(())
    })?;
    Ok(metadata)
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Backups found under `backups_dir`, newest first. Directories without
/// readable metadata are skipped.
pub fn list_backups(backups_dir: &Path) -> Result<Vec<BackupInfo>, error::BoardstackError> {
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(backups_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(metadata) = read_metadata(&entry.path()) else {
            continue;
        };
        let size_bytes = fs::metadata(entry.path().join(&metadata.database))
            .map(|m| m.len())
            .unwrap_or(0);
        out.push(BackupInfo {
            name: metadata.backup_name,
            created_at: metadata.created_at,
            target: metadata.target,
            size_bytes,
            sha256: metadata.sha256,
        });
    }
    out.sort_by(|a, b| {
        epoch_of(&b.created_at)
            .cmp(&epoch_of(&a.created_at))
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(out)
}

// ===== Database service =====

/// A SQL database that can be dumped to a script and reloaded from one.
pub trait SqlDumper {
    /// Plain-SQL dump that drops and recreates every object it contains.
    fn dump(&self) -> Result<Vec<u8>, error::BoardstackError>;

    /// Runs a dump produced by `dump` against the live database.
    fn load(&self, script: &[u8]) -> Result<(), error::BoardstackError>;
}

pub fn pg_dump_argv(login: &PostgresLogin) -> Vec<String> {
    [
        "pg_dump",
        "--username",
        login.user.as_str(),
        "--dbname",
        login.database.as_str(),
        "--clean",
        "--if-exists",
        "--no-owner",
        "--no-privileges",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// `psql` reading a script from stdin; stops at the first error and rolls
/// the whole script back.
pub fn psql_restore_argv(login: &PostgresLogin) -> Vec<String> {
    [
        "psql",
        "--username",
        login.user.as_str(),
        "--dbname",
        login.database.as_str(),
        "--quiet",
        "--single-transaction",
        "--set",
        "ON_ERROR_STOP=1",
        "--file",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// The stack's PostgreSQL service, reached through `compose exec`.
pub struct PostgresService {
    runner: ComposeRunner,
    login: PostgresLogin,
}

impl PostgresService {
    pub fn new(runner: ComposeRunner, login: PostgresLogin) -> Self {
        Self { runner, login }
    }

    pub fn for_project(project: &Project) -> Result<Self, error::BoardstackError> {
        let env = project.env()?;
        let login = PostgresLogin::from_config(
            &project.config,
            &env,
            &project.config.smoke.database_service,
        )?;
        Ok(Self::new(ComposeRunner::detect(project)?, login))
    }
}

impl SqlDumper for PostgresService {
    fn dump(&self) -> Result<Vec<u8>, error::BoardstackError> {
        let out = self.runner.run_checked(&compose::exec_args(
            &self.login.service,
            &pg_dump_argv(&self.login),
        ))?;
        Ok(out.into_bytes())
    }

    fn load(&self, script: &[u8]) -> Result<(), error::BoardstackError> {
        self.runner.run_with_input(
            &compose::exec_args(&self.login.service, &psql_restore_argv(&self.login)),
            script,
        )?;
        Ok(())
    }
}

/// Dumps the database service into `<backups_dir>/<name>/postgresql_dump.sql`.
pub fn create_sql_backup(
    dumper: &dyn SqlDumper,
    backups_dir: &Path,
    name: Option<&str>,
) -> Result<BackupMetadata, error::BoardstackError> {
    let (name, dir) = claim_backup_dir(backups_dir, name)?;
    let written = dumper.dump().and_then(|script| {
        if script.iter().all(u8::is_ascii_whitespace) {
            return Err(error::BoardstackError::RuntimeError(
                "database dump came back empty".to_string(),
            ));
        }
        fs::write(dir.join(POSTGRES_DUMP_FILE), script)?;
        Ok(())
    });
    if let Err(e) = written {
        let _ = fs::remove_dir_all(&dir);
        return Err(e);
    }
    seal_backup(
        &dir,
        name,
        BackupTarget::Docker,
        POSTGRES_DUMP_FILE,
        schemas::BOARD_SCHEMA_VERSION,
    )
}

/// Verifies the named dump and replays it against the database service.
pub fn restore_sql_backup(
    dumper: &dyn SqlDumper,
    backups_dir: &Path,
    name: &str,
) -> Result<BackupMetadata, error::BoardstackError> {
    let (metadata, snapshot) = verified_snapshot(backups_dir, name, BackupTarget::Docker)?;
    dumper.load(&fs::read(&snapshot)?)?;
    Ok(metadata)
}

// ===== CLI =====

#[derive(Parser, Debug)]
#[clap(name = "backup", about = "Snapshot and restore the board store")]
pub struct BackupCli {
    #[clap(subcommand)]
    pub command: BackupCommand,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Snapshot the store (default name: boardstack_backup_<epoch>).
    Create {
        name: Option<String>,
        #[clap(long, value_enum, default_value = "local")]
        target: BackupTarget,
    },
    /// Verify a snapshot and replace the live data with it.
    Restore {
        name: String,
        #[clap(long, value_enum, default_value = "local")]
        target: BackupTarget,
    },
    /// List snapshots, newest first.
    List,
}

pub fn run_backup_cli(
    project: &Project,
    store: &Store,
    cli: BackupCli,
) -> Result<(), error::BoardstackError> {
    let backups_dir = project.backups_dir();
    let backups_dir = backups_dir.as_path();
    let out = match cli.command {
        BackupCommand::Create { name, target } => {
            let metadata = match target {
                BackupTarget::Local => create_backup(store, backups_dir, name.as_deref())?,
                BackupTarget::Docker => create_sql_backup(
                    &PostgresService::for_project(project)?,
                    backups_dir,
                    name.as_deref(),
                )?,
            };
            eprintln!("{} {}", "backup created".green().bold(), metadata.backup_name);
            time::command_envelope(
                "backup.create",
                "ok",
                json!({ "backup": metadata, "path": backups_dir.join(&metadata.backup_name) }),
            )
        }
        BackupCommand::Restore { name, target } => {
            let metadata = match target {
                BackupTarget::Local => restore_backup(store, backups_dir, &name)?,
                BackupTarget::Docker => restore_sql_backup(
                    &PostgresService::for_project(project)?,
                    backups_dir,
                    &name,
                )?,
            };
            eprintln!("{} {}", "restored".green().bold(), metadata.backup_name);
            time::command_envelope("backup.restore", "ok", json!({ "backup": metadata }))
        }
        BackupCommand::List => {
            let backups = list_backups(backups_dir)?;
            time::command_envelope("backup.list", "ok", json!({ "backups": backups }))
        }
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
