//! File-backed key-value cache used when no cache engine container is running.
//!
//! Semantics mirror the handful of engine commands the stack relies on:
//! `PING`, `SET`, `GET`, `DEL`. Values survive a close and reopen of the file,
//! which is what the local smoke target asserts.

use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::store::Store;
use rusqlite::{OptionalExtension, params};
use std::fs;

pub const CACHE_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );
";

pub struct LocalCache {
    store: Store,
    broker: DbBroker,
}

impl LocalCache {
    pub fn open(store: &Store) -> Result<Self, error::BoardstackError> {
        fs::create_dir_all(&store.root)?;
        let cache = Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
        };
        cache
            .broker
            .with_conn(&store.cache_db(), "boardstack", "cache.init", |conn| {
                conn.execute_batch(CACHE_DB_SCHEMA)?;
                Ok(())
            })?;
        Ok(cache)
    }

    /// Returns `PONG` when the backing file is readable and writable.
    pub fn ping(&self) -> Result<String, error::BoardstackError> {
        self.broker
            .with_conn(&self.store.cache_db(), "boardstack", "cache.ping", |conn| {
                let _: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
                Ok("PONG".to_string())
            })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), error::BoardstackError> {
        self.broker
            .with_conn(&self.store.cache_db(), "boardstack", "cache.set", |conn| {
                conn.execute(
                    "INSERT INTO kv(key, value) VALUES(?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    params![key, value],
                )?;
                Ok(())
            })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, error::BoardstackError> {
        self.broker
            .with_conn(&self.store.cache_db(), "boardstack", "cache.get", |conn| {
                let value = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                    .optional()?;
                Ok(value)
            })
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, error::BoardstackError> {
        self.broker
            .with_conn(&self.store.cache_db(), "boardstack", "cache.del", |conn| {
                let n = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
                Ok(n > 0)
            })
    }
}
