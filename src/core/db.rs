use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::BoardstackError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::BoardstackError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::BoardstackError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::BoardstackError::RusqliteError)?;
    Ok(conn)
}

pub fn board_db_path(root: &Path) -> PathBuf {
    root.join(schemas::BOARD_DB_NAME)
}

/// Applies the board schema once. Re-running against an initialized store is a
/// no-op; a failure part-way through rolls back the whole schema.
pub fn initialize_board_db(root: &Path) -> Result<(), error::BoardstackError> {
    fs::create_dir_all(root).map_err(error::BoardstackError::IoError)?;
    let db_path = board_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "boardstack", "schema.init", apply_schema)
}

pub fn apply_schema(conn: &Connection) -> Result<(), error::BoardstackError> {
    let version = schema_version(conn)?;
    if version >= schemas::BOARD_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&schemas::sqlite_schema()).map_err(|e| {
        error::BoardstackError::DatabaseInitializationError(format!("schema apply failed: {}", e))
    })?;
    tx.pragma_update(None, "user_version", schemas::BOARD_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i64, error::BoardstackError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemaCounts {
    pub version: i64,
    pub tables: Vec<String>,
    pub indexes: Vec<String>,
    pub triggers: Vec<String>,
}

/// Reads the live schema objects from `sqlite_master`; autoindexes backing
/// UNIQUE constraints are excluded.
pub fn inspect_schema(conn: &Connection) -> Result<SchemaCounts, error::BoardstackError> {
    let names_of = |kind: &str| -> Result<Vec<String>, error::BoardstackError> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([kind], |row| row.get::<_, String>(0))?;
        let names = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    };

    Ok(SchemaCounts {
        version: schema_version(conn)?,
        tables: names_of("table")?,
        indexes: names_of("index")?,
        triggers: names_of("trigger")?,
    })
}
