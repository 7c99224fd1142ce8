//! Centralized schema definitions for the board store.
//!
//! The relational model has two renderings:
//! 1. SQLite: the local store under `.boardstack/data/board.db` (used by the CLI,
//!    the local smoke target, seeding and backups).
//! 2. PostgreSQL: `init.sql`, mounted into the database container's
//!    `docker-entrypoint-initdb.d` and executed once on first start.
//!
//! Both carry six tables and seven named indexes. Updated-at maintenance is four
//! per-table triggers; PostgreSQL adds the shared trigger function.

pub const BOARD_DB_NAME: &str = "board.db";
pub const CACHE_DB_NAME: &str = "cache.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";

/// Stored in `PRAGMA user_version` once the schema has been applied.
/// Version 2 dropped the `WHEN` guard on the `updated_at` triggers.
pub const BOARD_SCHEMA_VERSION: i64 = 2;

pub const TABLES: [&str; 6] = [
    "users",
    "boards",
    "lists",
    "cards",
    "board_members",
    "card_assignments",
];

pub const INDEXES: [&str; 7] = [
    "idx_users_email_active",
    "idx_boards_owner",
    "idx_lists_board_position",
    "idx_cards_list_position",
    "idx_cards_due_date",
    "idx_board_members_user",
    "idx_card_assignments_user",
];

/// Tables whose `updated_at` is maintained by a trigger.
pub const TOUCHED_TABLES: [&str; 4] = ["users", "boards", "lists", "cards"];

// --- SQLite ---

pub const BOARD_DB_SCHEMA_USERS: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL UNIQUE,
        full_name TEXT,
        hashed_password TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_superuser INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
";

pub const BOARD_DB_SCHEMA_BOARDS: &str = "
    CREATE TABLE IF NOT EXISTS boards (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        owner_id TEXT NOT NULL,
        is_public INTEGER NOT NULL DEFAULT 0,
        background_color TEXT NOT NULL DEFAULT '#0079bf',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        FOREIGN KEY(owner_id) REFERENCES users(id) ON DELETE CASCADE
    )
";

pub const BOARD_DB_SCHEMA_LISTS: &str = "
    CREATE TABLE IF NOT EXISTS lists (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        board_id TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0 CHECK(position >= 0),
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        FOREIGN KEY(board_id) REFERENCES boards(id) ON DELETE CASCADE
    )
";

pub const BOARD_DB_SCHEMA_CARDS: &str = "
    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        list_id TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0 CHECK(position >= 0),
        due_date TEXT,
        priority TEXT NOT NULL DEFAULT 'medium',
        labels TEXT NOT NULL DEFAULT '[]', -- JSON array of label strings
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        FOREIGN KEY(list_id) REFERENCES lists(id) ON DELETE CASCADE
    )
";

pub const BOARD_DB_SCHEMA_BOARD_MEMBERS: &str = "
    CREATE TABLE IF NOT EXISTS board_members (
        id TEXT PRIMARY KEY,
        board_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'member', -- owner, admin, member, viewer
        joined_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE(board_id, user_id),
        FOREIGN KEY(board_id) REFERENCES boards(id) ON DELETE CASCADE,
        FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
    )
";

pub const BOARD_DB_SCHEMA_CARD_ASSIGNMENTS: &str = "
    CREATE TABLE IF NOT EXISTS card_assignments (
        id TEXT PRIMARY KEY,
        card_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        assigned_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE(card_id, user_id),
        FOREIGN KEY(card_id) REFERENCES cards(id) ON DELETE CASCADE,
        FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
    )
";

pub const BOARD_DB_SCHEMA_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS idx_users_email_active ON users(email, is_active);
    CREATE INDEX IF NOT EXISTS idx_boards_owner ON boards(owner_id);
    CREATE INDEX IF NOT EXISTS idx_lists_board_position ON lists(board_id, position);
    CREATE INDEX IF NOT EXISTS idx_cards_list_position ON cards(list_id, position);
    CREATE INDEX IF NOT EXISTS idx_cards_due_date ON cards(due_date);
    CREATE INDEX IF NOT EXISTS idx_board_members_user ON board_members(user_id);
    CREATE INDEX IF NOT EXISTS idx_card_assignments_user ON card_assignments(user_id);
";

/// Renders the SQLite `updated_at` trigger for one table, replacing any
/// earlier version of it.
///
/// Every update is stamped, including ones that write `updated_at`
/// themselves. The trigger's own write does not re-fire it while
/// `recursive_triggers` is off, which is the SQLite default.
pub fn sqlite_touch_trigger(table: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS trg_{table}_updated_at;
CREATE TRIGGER trg_{table}_updated_at
    AFTER UPDATE ON {table}
    FOR EACH ROW
    BEGIN
        UPDATE {table} SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
    END;"
    )
}

/// Full SQLite schema in dependency order.
pub fn sqlite_schema() -> String {
    let mut sql = String::new();
    for ddl in [
        BOARD_DB_SCHEMA_USERS,
        BOARD_DB_SCHEMA_BOARDS,
        BOARD_DB_SCHEMA_LISTS,
        BOARD_DB_SCHEMA_CARDS,
        BOARD_DB_SCHEMA_BOARD_MEMBERS,
        BOARD_DB_SCHEMA_CARD_ASSIGNMENTS,
    ] {
        sql.push_str(ddl.trim_end());
        sql.push_str(";\n");
    }
    sql.push_str(BOARD_DB_SCHEMA_INDEXES);
    for table in TOUCHED_TABLES {
        sql.push_str(&sqlite_touch_trigger(table));
        sql.push('\n');
    }
    sql
}

// --- PostgreSQL ---

pub const POSTGRES_TOUCH_FUNCTION: &str = "update_updated_at_column";

pub const POSTGRES_INIT_SQL: &str = r#"-- Board schema, executed once by the postgres entrypoint on an empty data directory.

CREATE TABLE IF NOT EXISTS users (
    id VARCHAR(26) PRIMARY KEY,
    email VARCHAR(255) NOT NULL UNIQUE,
    username VARCHAR(100) NOT NULL UNIQUE,
    full_name VARCHAR(255),
    hashed_password VARCHAR(255) NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    is_superuser BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS boards (
    id VARCHAR(26) PRIMARY KEY,
    title VARCHAR(255) NOT NULL,
    description TEXT,
    owner_id VARCHAR(26) NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    is_public BOOLEAN NOT NULL DEFAULT FALSE,
    background_color VARCHAR(7) NOT NULL DEFAULT '#0079bf',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS lists (
    id VARCHAR(26) PRIMARY KEY,
    title VARCHAR(255) NOT NULL,
    board_id VARCHAR(26) NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
    position INTEGER NOT NULL DEFAULT 0 CHECK (position >= 0),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS cards (
    id VARCHAR(26) PRIMARY KEY,
    title VARCHAR(500) NOT NULL,
    description TEXT,
    list_id VARCHAR(26) NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
    position INTEGER NOT NULL DEFAULT 0 CHECK (position >= 0),
    due_date TIMESTAMPTZ,
    priority VARCHAR(20) NOT NULL DEFAULT 'medium',
    labels JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS board_members (
    id VARCHAR(26) PRIMARY KEY,
    board_id VARCHAR(26) NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
    user_id VARCHAR(26) NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role VARCHAR(50) NOT NULL DEFAULT 'member',
    joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (board_id, user_id)
);

CREATE TABLE IF NOT EXISTS card_assignments (
    id VARCHAR(26) PRIMARY KEY,
    card_id VARCHAR(26) NOT NULL REFERENCES cards(id) ON DELETE CASCADE,
    user_id VARCHAR(26) NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    assigned_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (card_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_users_email_active ON users(email, is_active);
CREATE INDEX IF NOT EXISTS idx_boards_owner ON boards(owner_id);
CREATE INDEX IF NOT EXISTS idx_lists_board_position ON lists(board_id, position);
CREATE INDEX IF NOT EXISTS idx_cards_list_position ON cards(list_id, position);
CREATE INDEX IF NOT EXISTS idx_cards_due_date ON cards(due_date);
CREATE INDEX IF NOT EXISTS idx_board_members_user ON board_members(user_id);
CREATE INDEX IF NOT EXISTS idx_card_assignments_user ON card_assignments(user_id);

CREATE OR REPLACE FUNCTION update_updated_at_column()
RETURNS TRIGGER AS $$
BEGIN
    NEW.updated_at = NOW();
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE TRIGGER trg_users_updated_at
    BEFORE UPDATE ON users
    FOR EACH ROW EXECUTE FUNCTION update_updated_at_column();

CREATE OR REPLACE TRIGGER trg_boards_updated_at
    BEFORE UPDATE ON boards
    FOR EACH ROW EXECUTE FUNCTION update_updated_at_column();

CREATE OR REPLACE TRIGGER trg_lists_updated_at
    BEFORE UPDATE ON lists
    FOR EACH ROW EXECUTE FUNCTION update_updated_at_column();

CREATE OR REPLACE TRIGGER trg_cards_updated_at
    BEFORE UPDATE ON cards
    FOR EACH ROW EXECUTE FUNCTION update_updated_at_column();
"#;

/// Names of every trigger object `init.sql` creates: the shared function plus
/// one trigger per touched table.
pub fn postgres_trigger_objects() -> Vec<String> {
    let mut out = vec![POSTGRES_TOUCH_FUNCTION.to_string()];
    out.extend(TOUCHED_TABLES.iter().map(|t| format!("trg_{}_updated_at", t)));
    out
}
