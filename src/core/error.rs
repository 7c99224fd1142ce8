use rusqlite;
use std::env;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardstackError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Constraint violation: {0}")]
    ConstraintError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Runtime error: {0}")]
    RuntimeError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl BoardstackError {
    /// Maps SQLite UNIQUE / FOREIGN KEY / CHECK violations to `ConstraintError`,
    /// leaving every other error untouched.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref msg) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                let detail = msg.clone().unwrap_or_else(|| failure.to_string());
                return BoardstackError::ConstraintError(detail);
            }
        }
        BoardstackError::RusqliteError(err)
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, BoardstackError::ConstraintError(_))
    }
}
