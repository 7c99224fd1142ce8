//! boardstack: a local-first deployment control plane for a kanban board stack.
//!
//! boardstack owns the parts of the deployment that are data rather than
//! engines: the relational model of the board app, the service descriptor,
//! the reverse-proxy routes, and the checks that prove data survives a
//! restart. PostgreSQL, Redis, Qdrant, Nginx and Compose stay opaque; they are
//! configured and driven through their own CLIs.
//!
//! # Architecture
//!
//! ## Project and store
//!
//! - **Project** (`boardstack.toml`): the descriptor, found by walking up from
//!   the working directory. `.env` next to it feeds `${VAR}` substitution.
//! - **Store** (`<project>/.boardstack/data/`, or `BOARDSTACK_STORE`): the
//!   local SQLite rendering of the board schema, the file-backed cache, and
//!   the broker audit log.
//!
//! ## The thin waist
//!
//! All store access routes through `DbBroker`: calls are serialized
//! in-process and each one appends a line to `broker.events.jsonl`.
//!
//! ## Plugins
//!
//! - `board`: users, boards, lists, cards, memberships, assignments
//! - `compose`: descriptor validation, start order, Compose rendering, `stack` commands
//! - `proxy`: Nginx routing and optional TLS
//! - `health`: probe state machine and status summaries
//! - `smoke`: persistence smoke test against Docker or the local store
//! - `seed`: deterministic development data
//! - `backup`: hashed snapshots of the store
//!
//! # Examples
//!
//! ```bash
//! boardstack init
//! boardstack stack validate
//! boardstack stack up
//! boardstack smoke --target local --settle 0
//! boardstack backup create
//! ```

pub mod core;
pub mod plugins;

use core::{broker, config, db, error, schemas, store::Store, time};
use plugins::{backup, board, compose, seed, smoke};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "boardstack",
    version = env!("CARGO_PKG_VERSION"),
    about = "Deployment control plane for the board stack"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write boardstack.toml and .env.example, then initialize the store
    #[clap(name = "init")]
    Init {
        /// Directory to initialize (defaults to the current directory).
        dir: Option<PathBuf>,
        /// Overwrite existing descriptor files.
        #[clap(long)]
        force: bool,
    },

    /// Apply, render, or inspect the board schema
    #[clap(name = "schema")]
    Schema(SchemaCli),

    /// Work with users, boards, lists and cards in the local store
    #[clap(name = "board", visible_alias = "b")]
    Board(board::BoardCli),

    /// Validate, render, and operate the service stack
    #[clap(name = "stack", visible_alias = "s")]
    Stack(compose::StackCli),

    /// Verify that data survives a restart of the backing services
    #[clap(name = "smoke")]
    Smoke(smoke::SmokeCli),

    /// Populate the local store with development data
    #[clap(name = "seed")]
    Seed(seed::SeedCli),

    /// Snapshot and restore the local store
    #[clap(name = "backup")]
    Backup(backup::BackupCli),

    /// Show the audit log of brokered store operations
    #[clap(name = "audit")]
    Audit {
        /// Only the last N events.
        #[clap(long)]
        tail: Option<usize>,
    },

    /// Show version information
    #[clap(name = "version")]
    Version,
}

#[derive(clap::Args, Debug)]
struct SchemaCli {
    #[clap(subcommand)]
    command: SchemaCommand,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Dialect {
    Sqlite,
    Postgres,
}

#[derive(Subcommand, Debug)]
enum SchemaCommand {
    /// Create the schema in the local store (no-op when already applied).
    Apply,
    /// Print the schema DDL.
    Render {
        #[clap(long, value_enum, default_value = "postgres")]
        dialect: Dialect,
    },
    /// Report tables, indexes and triggers present in the local store.
    Inspect,
}

fn project_root() -> Result<PathBuf, error::BoardstackError> {
    let current_dir = std::env::current_dir()?;
    config::find_project_root(&current_dir)
}

pub fn run() -> Result<(), error::BoardstackError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Init { dir, force } => {
            let target = match dir {
                Some(d) => d,
                None => std::env::current_dir()?,
            };
            let written = config::write_default_config(&target, force)?;
            let store = Store::for_project(&target);
            db::initialize_board_db(&store.root)?;

            for path in &written {
                eprintln!("{} {}", "wrote".green().bold(), path.display());
            }
            if written.is_empty() {
                eprintln!(
                    "{} descriptor already present (use --force to overwrite)",
                    "kept".yellow().bold()
                );
            }
            let out = time::command_envelope(
                "init",
                "ok",
                json!({ "project": target, "written": written, "store": store.root }),
            );
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::Schema(schema_cli) => match schema_cli.command {
            SchemaCommand::Render { dialect } => {
                match dialect {
                    Dialect::Postgres => print!("{}", schemas::POSTGRES_INIT_SQL),
                    Dialect::Sqlite => print!("{}", schemas::sqlite_schema()),
                }
                Ok(())
            }
            SchemaCommand::Apply => {
                let store = Store::for_project(&project_root()?);
                db::initialize_board_db(&store.root)?;
                let out = time::command_envelope(
                    "schema.apply",
                    "ok",
                    json!({ "db": store.board_db(), "version": schemas::BOARD_SCHEMA_VERSION }),
                );
                println!("{}", serde_json::to_string_pretty(&out)?);
                Ok(())
            }
            SchemaCommand::Inspect => {
                let store = Store::for_project(&project_root()?);
                let counts = broker::DbBroker::new(&store.root).with_conn(
                    &store.board_db(),
                    "boardstack",
                    "schema.inspect",
                    db::inspect_schema,
                )?;
                let out = time::command_envelope(
                    "schema.inspect",
                    "ok",
                    json!({
                        "schema": counts,
                        "postgres_trigger_objects": schemas::postgres_trigger_objects(),
                    }),
                );
                println!("{}", serde_json::to_string_pretty(&out)?);
                Ok(())
            }
        },
        Command::Board(board_cli) => {
            let store = Store::for_project(&project_root()?);
            board::run_board_cli(&store, board_cli)
        }
        Command::Stack(stack_cli) => {
            let project = config::Project::load(&project_root()?)?;
            compose::run_stack_cli(&project, stack_cli)
        }
        Command::Smoke(smoke_cli) => {
            let project = config::Project::load(&project_root()?)?;
            let store = Store::for_project(&project.root);
            smoke::run_smoke_cli(&project, &store, smoke_cli)
        }
        Command::Seed(seed_cli) => {
            let store = Store::for_project(&project_root()?);
            seed::run_seed_cli(&store, seed_cli)
        }
        Command::Backup(backup_cli) => {
            let project = config::Project::load(&project_root()?)?;
            let store = Store::for_project(&project.root);
            backup::run_backup_cli(&project, &store, backup_cli)
        }
        Command::Audit { tail } => {
            let store = Store::for_project(&project_root()?);
            let mut events = broker::read_audit_log(&store.root)?;
            if let Some(n) = tail {
                let skip = events.len().saturating_sub(n);
                events.drain(..skip);
            }
            let out = time::command_envelope("audit", "ok", json!({ "events": events }));
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}
