//! Relational board store: users, boards, lists, cards, memberships and
//! assignments.
//!
//! Every operation goes through the DB broker, so calls are serialized and
//! leave an audit line. Integrity (uniqueness, cascades, `updated_at`) lives
//! in the schema; this module validates value domains before rows are written.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error;
use crate::core::store::Store;
use crate::core::time;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use clap::{Parser, Subcommand, ValueEnum};
use rand::RngCore;
use rand::rngs::OsRng;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::OnceLock;

pub const MAX_LABELS: usize = 20;
pub const MAX_LABEL_LEN: usize = 50;
pub const DEFAULT_BACKGROUND_COLOR: &str = "#0079bf";

// ===== Value domains =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = error::BoardstackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(error::BoardstackError::ValidationError(format!(
                "unknown priority '{}' (expected low|medium|high|urgent)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    #[default]
    Member,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = error::BoardstackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            "viewer" => Ok(Role::Viewer),
            other => Err(error::BoardstackError::ValidationError(format!(
                "unknown role '{}' (expected owner|admin|member|viewer)",
                other
            ))),
        }
    }
}

/// Card labels: distinct, non-empty, bounded strings. Stored as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Labels(Vec<String>);

impl Labels {
    pub fn new<I, S>(labels: I) -> Result<Self, error::BoardstackError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for label in labels {
            let label: String = label.into();
            let label = label.trim().to_string();
            if label.is_empty() {
                return Err(error::BoardstackError::ValidationError(
                    "labels must not be empty".to_string(),
                ));
            }
            if label.chars().count() > MAX_LABEL_LEN {
                return Err(error::BoardstackError::ValidationError(format!(
                    "label '{}' exceeds {} characters",
                    label, MAX_LABEL_LEN
                )));
            }
            if !seen.insert(label.clone()) {
                return Err(error::BoardstackError::ValidationError(format!(
                    "duplicate label '{}'",
                    label
                )));
            }
            out.push(label);
        }
        if out.len() > MAX_LABELS {
            return Err(error::BoardstackError::ValidationError(format!(
                "at most {} labels per card (got {})",
                MAX_LABELS,
                out.len()
            )));
        }
        Ok(Self(out))
    }

    /// Parses the CLI form `a,b,c`; an empty string means no labels.
    pub fn parse_list(raw: &str) -> Result<Self, error::BoardstackError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::new(raw.split(','))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<String>> for Labels {
    type Error = error::BoardstackError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Labels::new(value)
    }
}

impl From<Labels> for Vec<String> {
    fn from(value: Labels) -> Self {
        value.0
    }
}

impl ToSql for Priority {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Priority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for Labels {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let text = serde_json::to_string(&self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(text))
    }
}

impl FromSql for Labels {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("static regex"))
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{3,100}$").expect("static regex"))
}

fn color_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("static regex"))
}

fn due_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?)?$")
            .expect("static regex")
    })
}

pub fn validate_email(email: &str) -> Result<(), error::BoardstackError> {
    if email.len() > 255 || !email_pattern().is_match(email) {
        return Err(error::BoardstackError::ValidationError(format!(
            "invalid email '{}'",
            email
        )));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), error::BoardstackError> {
    if !username_pattern().is_match(username) {
        return Err(error::BoardstackError::ValidationError(format!(
            "invalid username '{}' (3-100 chars of A-Z a-z 0-9 _ . -)",
            username
        )));
    }
    Ok(())
}

pub fn validate_color(color: &str) -> Result<(), error::BoardstackError> {
    if !color_pattern().is_match(color) {
        return Err(error::BoardstackError::ValidationError(format!(
            "background color '{}' must be #RRGGBB",
            color
        )));
    }
    Ok(())
}

pub fn validate_due_date(due: &str) -> Result<(), error::BoardstackError> {
    if !due_date_pattern().is_match(due) {
        return Err(error::BoardstackError::ValidationError(format!(
            "due date '{}' must be YYYY-MM-DD or RFC 3339",
            due
        )));
    }
    Ok(())
}

fn validate_title(kind: &str, title: &str, max: usize) -> Result<(), error::BoardstackError> {
    let len = title.trim().chars().count();
    if len == 0 || len > max {
        return Err(error::BoardstackError::ValidationError(format!(
            "{} title must be 1-{} characters",
            kind, max
        )));
    }
    Ok(())
}

fn validate_position(position: i64) -> Result<(), error::BoardstackError> {
    if position < 0 {
        return Err(error::BoardstackError::ValidationError(format!(
            "position must be >= 0 (got {})",
            position
        )));
    }
    Ok(())
}

/// Memory cost (log2 KiB) of stored password hashes.
pub const PASSWORD_MEMORY_COST_LOG2: u32 = 12;

fn password_hasher() -> Result<Argon2<'static>, error::BoardstackError> {
    let params = Params::new(1u32 << PASSWORD_MEMORY_COST_LOG2, 3, 1, None)
        .map_err(|e| error::BoardstackError::RuntimeError(format!("argon2 params: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hashes a password into a PHC string (`$argon2id$v=19$...`) with a fresh
/// random salt.
pub fn hash_password(password: &str) -> Result<String, error::BoardstackError> {
    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| error::BoardstackError::RuntimeError(format!("password salt: {}", e)))?;

    let hash = password_hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| error::BoardstackError::RuntimeError(format!("password hash: {}", e)))?;
    Ok(hash.to_string())
}

/// Checks a password against a stored PHC string. A malformed stored hash is
/// an error; a wrong password is `Ok(false)`.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, error::BoardstackError> {
    let parsed = PasswordHash::new(stored).map_err(|e| {
        error::BoardstackError::ValidationError(format!("stored password hash: {}", e))
    })?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(error::BoardstackError::RuntimeError(format!(
            "password verify: {}",
            e
        ))),
    }
}

// ===== Rows =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub is_public: bool,
    pub background_color: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardList {
    pub id: String,
    pub title: String,
    pub board_id: String,
    pub position: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub list_id: String,
    pub position: i64,
    pub due_date: Option<String>,
    pub priority: Priority,
    pub labels: Labels,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardMember {
    pub id: String,
    pub board_id: String,
    pub user_id: String,
    pub role: Role,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardAssignment {
    pub id: String,
    pub card_id: String,
    pub user_id: String,
    pub assigned_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardSummary {
    pub board_id: String,
    pub title: String,
    pub lists: i64,
    pub cards: i64,
    pub members: i64,
}

const USER_COLUMNS: &str =
    "id, email, username, full_name, hashed_password, is_active, is_superuser, created_at, updated_at";
const BOARD_COLUMNS: &str =
    "id, title, description, owner_id, is_public, background_color, created_at, updated_at";
const LIST_COLUMNS: &str = "id, title, board_id, position, created_at, updated_at";
const CARD_COLUMNS: &str =
    "id, title, description, list_id, position, due_date, priority, labels, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        full_name: row.get(3)?,
        hashed_password: row.get(4)?,
        is_active: row.get(5)?,
        is_superuser: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn board_from_row(row: &Row<'_>) -> rusqlite::Result<Board> {
    Ok(Board {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        is_public: row.get(4)?,
        background_color: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn list_from_row(row: &Row<'_>) -> rusqlite::Result<BoardList> {
    Ok(BoardList {
        id: row.get(0)?,
        title: row.get(1)?,
        board_id: row.get(2)?,
        position: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        list_id: row.get(3)?,
        position: row.get(4)?,
        due_date: row.get(5)?,
        priority: row.get(6)?,
        labels: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ===== Inputs =====

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub hashed_password: String,
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewBoard {
    pub title: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub is_public: bool,
    /// Defaults to `#0079bf`.
    pub background_color: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCard {
    pub title: String,
    pub description: Option<String>,
    pub list_id: String,
    /// Appends to the end of the list when unset.
    pub position: Option<i64>,
    pub due_date: Option<String>,
    pub priority: Priority,
    pub labels: Labels,
}

#[derive(Debug, Clone, Default)]
pub struct CardUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub clear_description: bool,
    pub priority: Option<Priority>,
    pub due_date: Option<String>,
    pub clear_due_date: bool,
    pub labels: Option<Labels>,
}

impl CardUpdate {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && !self.clear_description
            && self.priority.is_none()
            && self.due_date.is_none()
            && !self.clear_due_date
            && self.labels.is_none()
    }
}

// ===== Store =====

fn not_found(kind: &str, id: &str) -> error::BoardstackError {
    error::BoardstackError::NotFound(format!("{} '{}'", kind, id))
}

fn next_position(
    conn: &Connection,
    table: &str,
    parent_col: &str,
    parent_id: &str,
) -> Result<i64, error::BoardstackError> {
    let sql = format!(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM {} WHERE {} = ?1",
        table, parent_col
    );
    Ok(conn.query_row(&sql, [parent_id], |row| row.get(0))?)
}

/// Handle on the board database. Opening applies the schema if needed.
pub struct BoardStore {
    store: Store,
    broker: DbBroker,
    actor: String,
}

impl BoardStore {
    pub fn open(store: &Store) -> Result<Self, error::BoardstackError> {
        db::initialize_board_db(&store.root)?;
        Ok(Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
            actor: "boardstack".to_string(),
        })
    }

    /// Attributes subsequent audit events to `actor`.
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn with_conn<F, R>(&self, op: &str, f: F) -> Result<R, error::BoardstackError>
    where
        F: FnOnce(&Connection) -> Result<R, error::BoardstackError>,
    {
        self.broker
            .with_conn(&self.store.board_db(), &self.actor, op, f)
    }

    // --- users ---

    pub fn create_user(&self, new: &NewUser) -> Result<User, error::BoardstackError> {
        validate_email(&new.email)?;
        validate_username(&new.username)?;
        if new.hashed_password.is_empty() {
            return Err(error::BoardstackError::ValidationError(
                "password hash must not be empty".to_string(),
            ));
        }
        let id = time::new_row_id();
        self.with_conn("board.user.create", |conn| {
            conn.execute(
                "INSERT INTO users(id, email, username, full_name, hashed_password, is_superuser)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    new.email,
                    new.username,
                    new.full_name,
                    new.hashed_password,
                    new.is_superuser
                ],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            fetch_user(conn, &id)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, error::BoardstackError> {
        self.with_conn("board.user.get", |conn| {
            let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [email], user_from_row).optional()?)
        })
    }

    pub fn list_users(&self, active_only: bool) -> Result<Vec<User>, error::BoardstackError> {
        self.with_conn("board.user.list", |conn| {
            let sql = if active_only {
                format!(
                    "SELECT {} FROM users WHERE is_active = 1 ORDER BY email",
                    USER_COLUMNS
                )
            } else {
                format!("SELECT {} FROM users ORDER BY email", USER_COLUMNS)
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], user_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn deactivate_user(&self, id: &str) -> Result<User, error::BoardstackError> {
        self.with_conn("board.user.deactivate", |conn| {
            let n = conn.execute("UPDATE users SET is_active = 0 WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(not_found("user", id));
            }
            fetch_user(conn, id)
        })
    }

    /// Removes the user; owned boards, their lists and cards, memberships and
    /// assignments go with it.
    pub fn delete_user(&self, id: &str) -> Result<(), error::BoardstackError> {
        self.with_conn("board.user.delete", |conn| {
            let n = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(not_found("user", id));
            }
            Ok(())
        })
    }

    // --- boards ---

    /// Creates the board and records the owner as its first member.
    pub fn create_board(&self, new: &NewBoard) -> Result<Board, error::BoardstackError> {
        validate_title("board", &new.title, 255)?;
        let color = new
            .background_color
            .clone()
            .unwrap_or_else(|| DEFAULT_BACKGROUND_COLOR.to_string());
        validate_color(&color)?;

        let id = time::new_row_id();
        self.with_conn("board.board.create", |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO boards(id, title, description, owner_id, is_public, background_color)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    new.title.trim(),
                    new.description,
                    new.owner_id,
                    new.is_public,
                    color
                ],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            tx.execute(
                "INSERT INTO board_members(id, board_id, user_id, role) VALUES(?1, ?2, ?3, ?4)",
                params![time::new_row_id(), id, new.owner_id, Role::Owner],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            tx.commit()?;
            fetch_board(conn, &id)
        })
    }

    pub fn list_boards(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Vec<Board>, error::BoardstackError> {
        self.with_conn("board.board.list", |conn| {
            let boards = match owner_id {
                Some(owner) => {
                    let sql = format!(
                        "SELECT {} FROM boards WHERE owner_id = ?1 ORDER BY created_at, id",
                        BOARD_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map([owner], board_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let sql =
                        format!("SELECT {} FROM boards ORDER BY created_at, id", BOARD_COLUMNS);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map([], board_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(boards)
        })
    }

    pub fn rename_board(&self, id: &str, title: &str) -> Result<Board, error::BoardstackError> {
        validate_title("board", title, 255)?;
        self.with_conn("board.board.rename", |conn| {
            let n = conn.execute(
                "UPDATE boards SET title = ?2 WHERE id = ?1",
                params![id, title.trim()],
            )?;
            if n == 0 {
                return Err(not_found("board", id));
            }
            fetch_board(conn, id)
        })
    }

    pub fn delete_board(&self, id: &str) -> Result<(), error::BoardstackError> {
        self.with_conn("board.board.delete", |conn| {
            let n = conn.execute("DELETE FROM boards WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(not_found("board", id));
            }
            Ok(())
        })
    }

    // --- lists ---

    pub fn create_list(
        &self,
        board_id: &str,
        title: &str,
        position: Option<i64>,
    ) -> Result<BoardList, error::BoardstackError> {
        validate_title("list", title, 255)?;
        if let Some(p) = position {
            validate_position(p)?;
        }
        let id = time::new_row_id();
        self.with_conn("board.list.create", |conn| {
            let position = match position {
                Some(p) => p,
                None => next_position(conn, "lists", "board_id", board_id)?,
            };
            conn.execute(
                "INSERT INTO lists(id, title, board_id, position) VALUES(?1, ?2, ?3, ?4)",
                params![id, title.trim(), board_id, position],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            let sql = format!("SELECT {} FROM lists WHERE id = ?1", LIST_COLUMNS);
            Ok(conn.query_row(&sql, [&id], list_from_row)?)
        })
    }

    pub fn list_lists(&self, board_id: &str) -> Result<Vec<BoardList>, error::BoardstackError> {
        self.with_conn("board.list.list", |conn| {
            let sql = format!(
                "SELECT {} FROM lists WHERE board_id = ?1 ORDER BY position, created_at",
                LIST_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([board_id], list_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn delete_list(&self, id: &str) -> Result<(), error::BoardstackError> {
        self.with_conn("board.list.delete", |conn| {
            let n = conn.execute("DELETE FROM lists WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(not_found("list", id));
            }
            Ok(())
        })
    }

    // --- cards ---

    pub fn create_card(&self, new: &NewCard) -> Result<Card, error::BoardstackError> {
        validate_title("card", &new.title, 500)?;
        if let Some(p) = new.position {
            validate_position(p)?;
        }
        if let Some(due) = &new.due_date {
            validate_due_date(due)?;
        }
        let id = time::new_row_id();
        self.with_conn("board.card.create", |conn| {
            let position = match new.position {
                Some(p) => p,
                None => next_position(conn, "cards", "list_id", &new.list_id)?,
            };
            conn.execute(
                "INSERT INTO cards(id, title, description, list_id, position, due_date, priority, labels)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    new.title.trim(),
                    new.description,
                    new.list_id,
                    position,
                    new.due_date,
                    new.priority,
                    new.labels
                ],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            fetch_card(conn, &id)
        })
    }

    pub fn get_card(&self, id: &str) -> Result<Option<Card>, error::BoardstackError> {
        self.with_conn("board.card.get", |conn| {
            let sql = format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS);
            Ok(conn.query_row(&sql, [id], card_from_row).optional()?)
        })
    }

    pub fn list_cards(&self, list_id: &str) -> Result<Vec<Card>, error::BoardstackError> {
        self.with_conn("board.card.list", |conn| {
            let sql = format!(
                "SELECT {} FROM cards WHERE list_id = ?1 ORDER BY position, created_at",
                CARD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([list_id], card_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn update_card(
        &self,
        id: &str,
        update: &CardUpdate,
    ) -> Result<Card, error::BoardstackError> {
        if update.is_empty() {
            return Err(error::BoardstackError::ValidationError(
                "card update changes nothing".to_string(),
            ));
        }
        if let Some(title) = &update.title {
            validate_title("card", title, 500)?;
        }
        if let Some(due) = &update.due_date {
            validate_due_date(due)?;
        }
        if update.clear_description && update.description.is_some() {
            return Err(error::BoardstackError::ValidationError(
                "cannot both set and clear a card description".to_string(),
            ));
        }
        if update.clear_due_date && update.due_date.is_some() {
            return Err(error::BoardstackError::ValidationError(
                "cannot both set and clear a card due date".to_string(),
            ));
        }
        self.with_conn("board.card.update", |conn| {
            let n = conn.execute(
                "UPDATE cards SET
                    title = COALESCE(?2, title),
                    description = CASE WHEN ?8 THEN NULL ELSE COALESCE(?3, description) END,
                    priority = COALESCE(?4, priority),
                    due_date = CASE WHEN ?5 THEN NULL ELSE COALESCE(?6, due_date) END,
                    labels = COALESCE(?7, labels)
                 WHERE id = ?1",
                params![
                    id,
                    update.title.as_deref().map(str::trim),
                    update.description,
                    update.priority,
                    update.clear_due_date,
                    update.due_date,
                    update.labels,
                    update.clear_description
                ],
            )?;
            if n == 0 {
                return Err(not_found("card", id));
            }
            fetch_card(conn, id)
        })
    }

    /// Moves a card to `position` in `list_id` (clamped to the list's end),
    /// closing the gap it leaves and shifting later cards down.
    pub fn move_card(
        &self,
        id: &str,
        list_id: &str,
        position: i64,
    ) -> Result<Card, error::BoardstackError> {
        validate_position(position)?;
        self.with_conn("board.card.move", |conn| {
            let tx = conn.unchecked_transaction()?;
            let (from_list, from_pos): (String, i64) = tx
                .query_row(
                    "SELECT list_id, position FROM cards WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| not_found("card", id))?;

            let target_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM lists WHERE id = ?1)",
                [list_id],
                |row| row.get(0),
            )?;
            if !target_exists {
                return Err(not_found("list", list_id));
            }

            tx.execute(
                "UPDATE cards SET position = position - 1
                 WHERE list_id = ?1 AND position > ?2 AND id != ?3",
                params![from_list, from_pos, id],
            )?;

            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM cards WHERE list_id = ?1 AND id != ?2",
                params![list_id, id],
                |row| row.get(0),
            )?;
            let position = position.min(remaining);

            tx.execute(
                "UPDATE cards SET position = position + 1
                 WHERE list_id = ?1 AND position >= ?2 AND id != ?3",
                params![list_id, position, id],
            )?;
            tx.execute(
                "UPDATE cards SET list_id = ?2, position = ?3 WHERE id = ?1",
                params![id, list_id, position],
            )?;
            tx.commit()?;
            fetch_card(conn, id)
        })
    }

    // --- memberships / assignments ---

    /// Fails with a constraint error when the user is already a member.
    pub fn add_member(
        &self,
        board_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<BoardMember, error::BoardstackError> {
        let id = time::new_row_id();
        self.with_conn("board.member.add", |conn| {
            conn.execute(
                "INSERT INTO board_members(id, board_id, user_id, role) VALUES(?1, ?2, ?3, ?4)",
                params![id, board_id, user_id, role],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            Ok(conn.query_row(
                "SELECT id, board_id, user_id, role, joined_at FROM board_members WHERE id = ?1",
                [&id],
                |row| {
                    Ok(BoardMember {
                        id: row.get(0)?,
                        board_id: row.get(1)?,
                        user_id: row.get(2)?,
                        role: row.get(3)?,
                        joined_at: row.get(4)?,
                    })
                },
            )?)
        })
    }

    pub fn list_members(&self, board_id: &str) -> Result<Vec<BoardMember>, error::BoardstackError> {
        self.with_conn("board.member.list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, board_id, user_id, role, joined_at FROM board_members
                 WHERE board_id = ?1 ORDER BY joined_at, id",
            )?;
            let rows = stmt.query_map([board_id], |row| {
                Ok(BoardMember {
                    id: row.get(0)?,
                    board_id: row.get(1)?,
                    user_id: row.get(2)?,
                    role: row.get(3)?,
                    joined_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Fails with a constraint error when the user is already assigned.
    pub fn assign_card(
        &self,
        card_id: &str,
        user_id: &str,
    ) -> Result<CardAssignment, error::BoardstackError> {
        let id = time::new_row_id();
        self.with_conn("board.card.assign", |conn| {
            conn.execute(
                "INSERT INTO card_assignments(id, card_id, user_id) VALUES(?1, ?2, ?3)",
                params![id, card_id, user_id],
            )
            .map_err(error::BoardstackError::from_sqlite)?;
            Ok(conn.query_row(
                "SELECT id, card_id, user_id, assigned_at FROM card_assignments WHERE id = ?1",
                [&id],
                |row| {
                    Ok(CardAssignment {
                        id: row.get(0)?,
                        card_id: row.get(1)?,
                        user_id: row.get(2)?,
                        assigned_at: row.get(3)?,
                    })
                },
            )?)
        })
    }

    pub fn board_summary(&self, board_id: &str) -> Result<BoardSummary, error::BoardstackError> {
        self.with_conn("board.board.summary", |conn| {
            let title: String = conn
                .query_row("SELECT title FROM boards WHERE id = ?1", [board_id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or_else(|| not_found("board", board_id))?;
            let lists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lists WHERE board_id = ?1",
                [board_id],
                |row| row.get(0),
            )?;
            let cards: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cards c JOIN lists l ON l.id = c.list_id WHERE l.board_id = ?1",
                [board_id],
                |row| row.get(0),
            )?;
            let members: i64 = conn.query_row(
                "SELECT COUNT(*) FROM board_members WHERE board_id = ?1",
                [board_id],
                |row| row.get(0),
            )?;
            Ok(BoardSummary {
                board_id: board_id.to_string(),
                title,
                lists,
                cards,
                members,
            })
        })
    }

    /// Reads the live schema; fails if the store is unreadable.
    pub fn ping(&self) -> Result<db::SchemaCounts, error::BoardstackError> {
        self.with_conn("board.ping", db::inspect_schema)
    }

    /// Number of users with this email; the persistence check expects `1`.
    pub fn count_users_by_email(&self, email: &str) -> Result<i64, error::BoardstackError> {
        self.with_conn("board.user.count", |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM users WHERE email = ?1",
                [email],
                |row| row.get(0),
            )?)
        })
    }
}

fn fetch_user(conn: &Connection, id: &str) -> Result<User, error::BoardstackError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    conn.query_row(&sql, [id], user_from_row)
        .optional()?
        .ok_or_else(|| not_found("user", id))
}

fn fetch_board(conn: &Connection, id: &str) -> Result<Board, error::BoardstackError> {
    let sql = format!("SELECT {} FROM boards WHERE id = ?1", BOARD_COLUMNS);
    conn.query_row(&sql, [id], board_from_row)
        .optional()?
        .ok_or_else(|| not_found("board", id))
}

fn fetch_card(conn: &Connection, id: &str) -> Result<Card, error::BoardstackError> {
    let sql = format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS);
    conn.query_row(&sql, [id], card_from_row)
        .optional()?
        .ok_or_else(|| not_found("card", id))
}

// ===== CLI =====

#[derive(Parser, Debug)]
#[clap(name = "board", about = "Work with the local board store")]
pub struct BoardCli {
    #[clap(subcommand)]
    pub command: BoardCommand,
}

#[derive(Subcommand, Debug)]
pub enum BoardCommand {
    /// Manage users.
    User {
        #[clap(subcommand)]
        command: UserCommand,
    },
    /// Manage boards.
    Board {
        #[clap(subcommand)]
        command: BoardsCommand,
    },
    /// Manage lists on a board.
    List {
        #[clap(subcommand)]
        command: ListCommand,
    },
    /// Manage cards.
    Card {
        #[clap(subcommand)]
        command: CardCommand,
    },
    /// Add a user to a board.
    Member {
        board_id: String,
        user_id: String,
        #[clap(long, value_enum, default_value = "member")]
        role: Role,
    },
    /// Assign a card to a user.
    Assign { card_id: String, user_id: String },
    /// Count lists, cards and members of a board.
    Summary { board_id: String },
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    Add {
        email: String,
        username: String,
        #[clap(long)]
        password: String,
        #[clap(long)]
        full_name: Option<String>,
        #[clap(long)]
        superuser: bool,
    },
    Get {
        email: String,
    },
    /// Check a password against the stored hash.
    Verify {
        email: String,
        #[clap(long)]
        password: String,
    },
    List {
        #[clap(long)]
        active: bool,
    },
    Deactivate {
        id: String,
    },
    /// Delete a user and everything they own.
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum BoardsCommand {
    Add {
        title: String,
        #[clap(long)]
        owner: String,
        #[clap(long)]
        description: Option<String>,
        #[clap(long)]
        public: bool,
        #[clap(long)]
        color: Option<String>,
    },
    List {
        #[clap(long)]
        owner: Option<String>,
    },
    Rename {
        id: String,
        title: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ListCommand {
    Add {
        board_id: String,
        title: String,
        #[clap(long)]
        position: Option<i64>,
    },
    List {
        board_id: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CardCommand {
    Add {
        list_id: String,
        title: String,
        #[clap(long)]
        description: Option<String>,
        #[clap(long)]
        position: Option<i64>,
        #[clap(long)]
        due: Option<String>,
        #[clap(long, value_enum, default_value = "medium")]
        priority: Priority,
        /// Comma-separated labels.
        #[clap(long, default_value = "")]
        labels: String,
    },
    Show {
        id: String,
    },
    List {
        list_id: String,
    },
    Update {
        id: String,
        #[clap(long)]
        title: Option<String>,
        #[clap(long, conflicts_with = "clear_description")]
        description: Option<String>,
        #[clap(long)]
        clear_description: bool,
        #[clap(long, value_enum)]
        priority: Option<Priority>,
        #[clap(long, conflicts_with = "clear_due")]
        due: Option<String>,
        #[clap(long)]
        clear_due: bool,
        #[clap(long)]
        labels: Option<String>,
    },
    Move {
        id: String,
        list_id: String,
        #[clap(long, default_value_t = 0)]
        position: i64,
    },
}

pub fn run_board_cli(store: &Store, cli: BoardCli) -> Result<(), error::BoardstackError> {
    let boards = BoardStore::open(store)?;
    let out = match cli.command {
        BoardCommand::User { command } => match command {
            UserCommand::Add {
                email,
                username,
                password,
                full_name,
                superuser,
            } => {
                let user = boards.create_user(&NewUser {
                    email,
                    username,
                    full_name,
                    hashed_password: hash_password(&password)?,
                    is_superuser: superuser,
                })?;
                time::command_envelope("board.user.add", "ok", json!({ "user": user }))
            }
            UserCommand::Get { email } => {
                let user = boards
                    .get_user_by_email(&email)?
                    .ok_or_else(|| not_found("user", &email))?;
                time::command_envelope("board.user.get", "ok", json!({ "user": user }))
            }
            UserCommand::Verify { email, password } => {
                let user = boards
                    .get_user_by_email(&email)?
                    .ok_or_else(|| not_found("user", &email))?;
                let valid = user.is_active && verify_password(&password, &user.hashed_password)?;
                time::command_envelope(
                    "board.user.verify",
                    if valid { "ok" } else { "error" },
                    json!({ "email": email, "valid": valid }),
                )
            }
            UserCommand::List { active } => {
                let users = boards.list_users(active)?;
                time::command_envelope("board.user.list", "ok", json!({ "users": users }))
            }
            UserCommand::Deactivate { id } => {
                let user = boards.deactivate_user(&id)?;
                time::command_envelope("board.user.deactivate", "ok", json!({ "user": user }))
            }
            UserCommand::Delete { id } => {
                boards.delete_user(&id)?;
                time::command_envelope("board.user.delete", "ok", json!({ "id": id }))
            }
        },
        BoardCommand::Board { command } => match command {
            BoardsCommand::Add {
                title,
                owner,
                description,
                public,
                color,
            } => {
                let board = boards.create_board(&NewBoard {
                    title,
                    description,
                    owner_id: owner,
                    is_public: public,
                    background_color: color,
                })?;
                time::command_envelope("board.board.add", "ok", json!({ "board": board }))
            }
            BoardsCommand::List { owner } => {
                let list = boards.list_boards(owner.as_deref())?;
                time::command_envelope("board.board.list", "ok", json!({ "boards": list }))
            }
            BoardsCommand::Rename { id, title } => {
                let board = boards.rename_board(&id, &title)?;
                time::command_envelope("board.board.rename", "ok", json!({ "board": board }))
            }
            BoardsCommand::Delete { id } => {
                boards.delete_board(&id)?;
                time::command_envelope("board.board.delete", "ok", json!({ "id": id }))
            }
        },
        BoardCommand::List { command } => match command {
            ListCommand::Add {
                board_id,
                title,
                position,
            } => {
                let list = boards.create_list(&board_id, &title, position)?;
                time::command_envelope("board.list.add", "ok", json!({ "list": list }))
            }
            ListCommand::List { board_id } => {
                let lists = boards.list_lists(&board_id)?;
                time::command_envelope("board.list.list", "ok", json!({ "lists": lists }))
            }
            ListCommand::Delete { id } => {
                boards.delete_list(&id)?;
                time::command_envelope("board.list.delete", "ok", json!({ "id": id }))
            }
        },
        BoardCommand::Card { command } => match command {
            CardCommand::Add {
                list_id,
                title,
                description,
                position,
                due,
                priority,
                labels,
            } => {
                let card = boards.create_card(&NewCard {
                    title,
                    description,
                    list_id,
                    position,
                    due_date: due,
                    priority,
                    labels: Labels::parse_list(&labels)?,
                })?;
                time::command_envelope("board.card.add", "ok", json!({ "card": card }))
            }
            CardCommand::Show { id } => {
                let card = boards.get_card(&id)?.ok_or_else(|| not_found("card", &id))?;
                time::command_envelope("board.card.show", "ok", json!({ "card": card }))
            }
            CardCommand::List { list_id } => {
                let cards = boards.list_cards(&list_id)?;
                time::command_envelope("board.card.list", "ok", json!({ "cards": cards }))
            }
            CardCommand::Update {
                id,
                title,
                description,
                clear_description,
                priority,
                due,
                clear_due,
                labels,
            } => {
                let labels = labels.as_deref().map(Labels::parse_list).transpose()?;
                let card = boards.update_card(
                    &id,
                    &CardUpdate {
                        title,
                        description,
                        clear_description,
                        priority,
                        due_date: due,
                        clear_due_date: clear_due,
                        labels,
                    },
                )?;
                time::command_envelope("board.card.update", "ok", json!({ "card": card }))
            }
            CardCommand::Move {
                id,
                list_id,
                position,
            } => {
                let card = boards.move_card(&id, &list_id, position)?;
                time::command_envelope("board.card.move", "ok", json!({ "card": card }))
            }
        },
        BoardCommand::Member {
            board_id,
            user_id,
            role,
        } => {
            let member = boards.add_member(&board_id, &user_id, role)?;
            time::command_envelope("board.member.add", "ok", json!({ "member": member }))
        }
        BoardCommand::Assign { card_id, user_id } => {
            let assignment = boards.assign_card(&card_id, &user_id)?;
            time::command_envelope("board.assign", "ok", json!({ "assignment": assignment }))
        }
        BoardCommand::Summary { board_id } => {
            let summary = boards.board_summary(&board_id)?;
            time::command_envelope("board.summary", "ok", json!({ "summary": summary }))
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
