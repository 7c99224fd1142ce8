//! Store handle for boardstack's local state.
//!
//! A store is a directory holding the board database, the local cache file used
//! by the `local` smoke target, and the broker audit log.

use crate::core::schemas;
use std::path::{Path, PathBuf};

/// Environment override for the store root.
pub const STORE_ENV: &str = "BOARDSTACK_STORE";

/// Directory (relative to the project root) that marks a boardstack project.
pub const PROJECT_DIR: &str = ".boardstack";

#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<project>/.boardstack/data`, unless `BOARDSTACK_STORE` points elsewhere.
    pub fn for_project(project_root: &Path) -> Self {
        match std::env::var(STORE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::new(PathBuf::from(path)),
            _ => Self::new(project_root.join(PROJECT_DIR).join("data")),
        }
    }

    pub fn board_db(&self) -> PathBuf {
        self.root.join(schemas::BOARD_DB_NAME)
    }

    pub fn cache_db(&self) -> PathBuf {
        self.root.join(schemas::CACHE_DB_NAME)
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join(schemas::BROKER_EVENTS_NAME)
    }
}
