//! Persistence smoke test.
//!
//! Strictly sequential: validate, start the backing services, wait, probe,
//! write one relational record and one cache key, restart, wait, re-read and
//! compare. The first failing step ends the run; nothing is retried.

use crate::core::config::{BoardstackConfig, Project};
use crate::core::env::EnvContext;
use crate::core::error;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::board::{self, BoardStore, NewUser};
use crate::plugins::cache::LocalCache;
use crate::plugins::compose::{self, ComposeRunner, PostgresLogin, StackAction};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Password of the marker user; it never logs in.
const MARKER_PASSWORD: &str = "persist";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SmokeSettings {
    /// Services started and probed before any write.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    /// Services restarted between write and re-read.
    #[serde(default = "default_restart")]
    pub restart: Vec<String>,
    #[serde(default = "default_settle")]
    pub settle_seconds: u64,
    #[serde(default = "default_settle")]
    pub restart_settle_seconds: u64,
    #[serde(default = "default_record_email")]
    pub record_email: String,
    #[serde(default = "default_cache_key")]
    pub cache_key: String,
    #[serde(default = "default_database_service")]
    pub database_service: String,
    #[serde(default = "default_cache_service")]
    pub cache_service: String,
}

fn default_services() -> Vec<String> {
    vec!["postgres".into(), "redis".into(), "qdrant".into()]
}

fn default_restart() -> Vec<String> {
    vec!["postgres".into(), "redis".into()]
}

fn default_settle() -> u64 {
    10
}

fn default_record_email() -> String {
    "persist@test.com".to_string()
}

fn default_cache_key() -> String {
    "boardstack:smoke".to_string()
}

fn default_database_service() -> String {
    "postgres".to_string()
}

fn default_cache_service() -> String {
    "redis".to_string()
}

impl Default for SmokeSettings {
    fn default() -> Self {
        Self {
            services: default_services(),
            restart: default_restart(),
            settle_seconds: default_settle(),
            restart_settle_seconds: default_settle(),
            record_email: default_record_email(),
            cache_key: default_cache_key(),
            database_service: default_database_service(),
            cache_service: default_cache_service(),
        }
    }
}

/// What the smoke procedure needs from an environment. Services are named as
/// in the descriptor; targets decide what each name maps to.
pub trait SmokeTarget {
    fn name(&self) -> &str;

    /// Checks configuration before anything starts.
    fn validate(&mut self) -> Result<String, error::BoardstackError>;

    fn start(&mut self, services: &[String]) -> Result<String, error::BoardstackError>;

    /// Probes one service through its native client.
    fn probe(&mut self, service: &str) -> Result<String, error::BoardstackError>;

    /// Inserts the marker user unless it already exists.
    fn write_record(&mut self, email: &str) -> Result<(), error::BoardstackError>;

    /// `id|email|username` of the marker user, if present.
    fn read_record(&mut self, email: &str) -> Result<Option<String>, error::BoardstackError>;

    fn count_records(&mut self, email: &str) -> Result<i64, error::BoardstackError>;

    fn cache_set(&mut self, key: &str, value: &str) -> Result<(), error::BoardstackError>;

    fn cache_get(&mut self, key: &str) -> Result<Option<String>, error::BoardstackError>;

    fn restart(&mut self, services: &[String]) -> Result<String, error::BoardstackError>;

    fn settle(&mut self, seconds: u64) {
        std::thread::sleep(Duration::from_secs(seconds));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmokeStep {
    pub step: String,
    pub status: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmokeReport {
    pub target: String,
    pub passed: bool,
    pub steps: Vec<SmokeStep>,
}

impl SmokeReport {
    pub fn failed_step(&self) -> Option<&SmokeStep> {
        self.steps.iter().find(|s| s.status != "ok")
    }
}

struct Recorder {
    steps: Vec<SmokeStep>,
}

impl Recorder {
    /// Records the outcome; returns false when the run must stop.
    fn record(&mut self, step: &str, result: Result<String, error::BoardstackError>) -> bool {
        let (status, detail, ok) = match result {
            Ok(detail) => ("ok", detail, true),
            Err(e) => ("failed", e.to_string(), false),
        };
        self.steps.push(SmokeStep {
            step: step.to_string(),
            status: status.to_string(),
            detail,
        });
        ok
    }
}

fn mismatch(what: &str, before: &str, after: &str) -> error::BoardstackError {
    error::BoardstackError::ValidationError(format!(
        "{} changed across restart: before={} after={}",
        what, before, after
    ))
}

pub fn run_smoke(target: &mut dyn SmokeTarget, settings: &SmokeSettings) -> SmokeReport {
    let mut rec = Recorder { steps: Vec::new() };
    let passed = run_steps(target, settings, &mut rec);
    SmokeReport {
        target: target.name().to_string(),
        passed,
        steps: rec.steps,
    }
}

fn run_steps(target: &mut dyn SmokeTarget, settings: &SmokeSettings, rec: &mut Recorder) -> bool {
    if !rec.record("validate", target.validate()) {
        return false;
    }
    if !rec.record("start", target.start(&settings.services)) {
        return false;
    }
    target.settle(settings.settle_seconds);
    rec.record("settle", Ok(format!("{}s", settings.settle_seconds)));

    for service in &settings.services {
        if !rec.record(&format!("probe:{}", service), target.probe(service)) {
            return false;
        }
    }

    let email = settings.record_email.as_str();
    let written = target.write_record(email).and_then(|_| {
        target.read_record(email)?.ok_or_else(|| {
            error::BoardstackError::NotFound(format!("user '{}' after insert", email))
        })
    });
    let record_before = match &written {
        Ok(fingerprint) => fingerprint.clone(),
        Err(_) => String::new(),
    };
    if !rec.record("write:record", written) {
        return false;
    }

    let cache_value = time::new_event_id();
    let cached = target
        .cache_set(&settings.cache_key, &cache_value)
        .map(|_| format!("{}={}", settings.cache_key, cache_value));
    if !rec.record("write:cache", cached) {
        return false;
    }

    if !rec.record("restart", target.restart(&settings.restart)) {
        return false;
    }
    target.settle(settings.restart_settle_seconds);
    rec.record("settle", Ok(format!("{}s", settings.restart_settle_seconds)));

    for service in &settings.restart {
        if !rec.record(&format!("probe:{}", service), target.probe(service)) {
            return false;
        }
    }

    let count = target.count_records(email).and_then(|n| {
        if n == 1 {
            Ok(format!("count(users where email='{}') = 1", email))
        } else {
            Err(error::BoardstackError::ValidationError(format!(
                "expected 1 user with email '{}', found {}",
                email, n
            )))
        }
    });
    if !rec.record("verify:count", count) {
        return false;
    }

    let record_after = target.read_record(email).and_then(|after| {
        let after = after.unwrap_or_default();
        if after == record_before {
            Ok(after)
        } else {
            Err(mismatch("record", &record_before, &after))
        }
    });
    if !rec.record("verify:record", record_after) {
        return false;
    }

    let cache_after = target.cache_get(&settings.cache_key).and_then(|after| {
        let after = after.unwrap_or_default();
        if after == cache_value {
            Ok(format!("{}={}", settings.cache_key, after))
        } else {
            Err(mismatch("cache value", &cache_value, &after))
        }
    });
    rec.record("verify:cache", cache_after)
}

// ===== Local target =====

/// The SQLite store and the file-backed cache. "Restart" closes and reopens
/// both handles.
pub struct LocalTarget {
    store: Store,
    config: BoardstackConfig,
    env: EnvContext,
    settings: SmokeSettings,
    boards: Option<BoardStore>,
    cache: Option<LocalCache>,
}

impl LocalTarget {
    pub fn new(store: Store, config: BoardstackConfig, env: EnvContext) -> Self {
        let settings = config.smoke.clone();
        Self {
            store,
            config,
            env,
            settings,
            boards: None,
            cache: None,
        }
    }

    fn open(&mut self, service: &str) -> Result<String, error::BoardstackError> {
        if service == self.settings.database_service {
            self.boards = Some(BoardStore::open(&self.store)?.with_actor("smoke"));
            Ok(format!("{} -> {}", service, self.store.board_db().display()))
        } else if service == self.settings.cache_service {
            self.cache = Some(LocalCache::open(&self.store)?);
            Ok(format!("{} -> {}", service, self.store.cache_db().display()))
        } else {
            Ok(format!("{} (no local engine)", service))
        }
    }

    fn boards(&self) -> Result<&BoardStore, error::BoardstackError> {
        self.boards.as_ref().ok_or_else(|| {
            error::BoardstackError::RuntimeError("relational store is not running".to_string())
        })
    }

    fn cache(&self) -> Result<&LocalCache, error::BoardstackError> {
        self.cache.as_ref().ok_or_else(|| {
            error::BoardstackError::RuntimeError("cache is not running".to_string())
        })
    }
}

impl SmokeTarget for LocalTarget {
    fn name(&self) -> &str {
        "local"
    }

    fn validate(&mut self) -> Result<String, error::BoardstackError> {
        compose::ensure_valid(&self.config, &self.env)?;
        Ok(format!("{} services valid", self.config.services.len()))
    }

    fn start(&mut self, services: &[String]) -> Result<String, error::BoardstackError> {
        let mut started = Vec::new();
        for service in services {
            started.push(self.open(service)?);
        }
        Ok(started.join(", "))
    }

    fn probe(&mut self, service: &str) -> Result<String, error::BoardstackError> {
        if service == self.settings.database_service {
            let counts = self.boards()?.ping()?;
            Ok(format!(
                "{} tables, schema v{}",
                counts.tables.len(),
                counts.version
            ))
        } else if service == self.settings.cache_service {
            self.cache()?.ping()
        } else {
            Ok("skipped (no local engine)".to_string())
        }
    }

    fn write_record(&mut self, email: &str) -> Result<(), error::BoardstackError> {
        let boards = self.boards()?;
        if boards.get_user_by_email(email)?.is_some() {
            return Ok(());
        }
        boards.create_user(&NewUser {
            email: email.to_string(),
            username: marker_username(email),
            full_name: Some("Persistence Check".to_string()),
            hashed_password: board::hash_password(MARKER_PASSWORD)?,
            is_superuser: false,
        })?;
        Ok(())
    }

    fn read_record(&mut self, email: &str) -> Result<Option<String>, error::BoardstackError> {
        Ok(self
            .boards()?
            .get_user_by_email(email)?
            .map(|u| format!("{}|{}|{}", u.id, u.email, u.username)))
    }

    fn count_records(&mut self, email: &str) -> Result<i64, error::BoardstackError> {
        self.boards()?.count_users_by_email(email)
    }

    fn cache_set(&mut self, key: &str, value: &str) -> Result<(), error::BoardstackError> {
        self.cache()?.set(key, value)
    }

    fn cache_get(&mut self, key: &str) -> Result<Option<String>, error::BoardstackError> {
        self.cache()?.get(key)
    }

    fn restart(&mut self, services: &[String]) -> Result<String, error::BoardstackError> {
        for service in services {
            if service == &self.settings.database_service {
                self.boards = None;
            } else if service == &self.settings.cache_service {
                self.cache = None;
            }
        }
        let mut reopened = Vec::new();
        for service in services {
            reopened.push(self.open(service)?);
        }
        Ok(format!("reopened {}", reopened.join(", ")))
    }
}

// ===== Docker target =====

/// Username of the marker user. Derived from the email so that changing
/// `record_email` between runs never collides with an earlier marker.
pub fn marker_username(email: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(email.trim().to_lowercase().as_bytes()));
    format!("persist_{}", &digest[..12])
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn marker_insert_sql(id: &str, email: &str, hashed_password: &str) -> String {
    format!(
        "INSERT INTO users (id, email, username, full_name, hashed_password) \
         VALUES ({}, {}, {}, 'Persistence Check', {}) \
         ON CONFLICT DO NOTHING",
        sql_quote(id),
        sql_quote(email),
        sql_quote(&marker_username(email)),
        sql_quote(hashed_password),
    )
}

fn psql_argv(user: &str, db: &str, sql: &str) -> Vec<String> {
    [
        "psql",
        "-U",
        user,
        "-d",
        db,
        "-v",
        "ON_ERROR_STOP=1",
        "-tAc",
        sql,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Turns an already-substituted healthcheck `test` into an exec argv.
fn probe_argv(test: &[String]) -> Vec<String> {
    match test.split_first() {
        Some((kind, rest)) if kind == "CMD-SHELL" => {
            vec!["sh".to_string(), "-c".to_string(), rest.join(" ")]
        }
        Some((kind, rest)) if kind == "CMD" => rest.to_vec(),
        _ => test.to_vec(),
    }
}

/// Raw `--requirepass` argument of a cache service command, if any.
fn requirepass(command: &[String]) -> Option<&str> {
    let pos = command.iter().position(|a| a == "--requirepass")?;
    command.get(pos + 1).map(String::as_str)
}

fn redis_cli_argv(password: Option<&str>, args: &[&str]) -> Vec<String> {
    let mut argv = vec!["redis-cli".to_string()];
    if let Some(password) = password {
        argv.push("-a".to_string());
        argv.push(password.to_string());
        argv.push("--no-auth-warning".to_string());
    }
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

fn parse_count(out: &str) -> Result<i64, error::BoardstackError> {
    let out = out.trim();
    out.parse().map_err(|_| {
        error::BoardstackError::RuntimeError(format!("unexpected count output '{}'", out))
    })
}

/// Drives the running stack through `compose exec`.
pub struct DockerTarget {
    project: Project,
    env: EnvContext,
    runner: ComposeRunner,
}

impl DockerTarget {
    pub fn new(project: Project, env: EnvContext, runner: ComposeRunner) -> Self {
        Self {
            project,
            env,
            runner,
        }
    }

    fn settings(&self) -> &SmokeSettings {
        &self.project.config.smoke
    }

    fn exec(&self, service: &str, cmd: &[String]) -> Result<String, error::BoardstackError> {
        self.runner.run_checked(&compose::exec_args(service, cmd))
    }

    fn psql(&self, sql: &str) -> Result<String, error::BoardstackError> {
        let login = PostgresLogin::from_config(
            &self.project.config,
            &self.env,
            &self.settings().database_service,
        )?;
        let out = self.exec(&login.service, &psql_argv(&login.user, &login.database, sql))?;
        Ok(out.trim().to_string())
    }

    fn redis_cli(&self, args: &[&str]) -> Result<Vec<String>, error::BoardstackError> {
        let cache_service = &self.settings().cache_service;
        let raw = self
            .project
            .config
            .service(cache_service)
            .and_then(|s| s.command.as_deref())
            .and_then(requirepass);
        let password = match raw {
            Some(raw) => Some(self.env.substitute(raw)?),
            None => None,
        };
        Ok(redis_cli_argv(password.as_deref(), args))
    }
}

impl SmokeTarget for DockerTarget {
    fn name(&self) -> &str {
        "docker"
    }

    fn validate(&mut self) -> Result<String, error::BoardstackError> {
        compose::ensure_valid(&self.project.config, &self.env)?;
        compose::render_all(&self.project, &self.env)?;
        self.runner
            .run_checked(&compose::action_args(&StackAction::ValidateConfig))?;
        Ok(format!(
            "{} accepted {}",
            self.runner.runtime,
            self.runner.compose_file.display()
        ))
    }

    fn start(&mut self, services: &[String]) -> Result<String, error::BoardstackError> {
        let mut action = compose::action_args(&StackAction::Up);
        action.extend(services.iter().cloned());
        self.runner.run_checked(&action)?;
        Ok(services.join(", "))
    }

    /// Runs the service's declared healthcheck command inside its container.
    fn probe(&mut self, service: &str) -> Result<String, error::BoardstackError> {
        let probe = self
            .project
            .config
            .service(service)
            .and_then(|s| s.healthcheck.as_ref())
            .ok_or_else(|| {
                error::BoardstackError::ValidationError(format!(
                    "service '{}' declares no healthcheck to probe with",
                    service
                ))
            })?;
        let mut test = Vec::with_capacity(probe.test.len());
        for part in &probe.test {
            test.push(self.env.substitute(part)?);
        }
        let out = self.exec(service, &probe_argv(&test))?;
        let out = out.trim();
        Ok(if out.is_empty() {
            "probe passed".to_string()
        } else {
            out.lines().last().unwrap_or(out).to_string()
        })
    }

    fn write_record(&mut self, email: &str) -> Result<(), error::BoardstackError> {
        let hashed = board::hash_password(MARKER_PASSWORD)?;
        self.psql(&marker_insert_sql(&time::new_row_id(), email, &hashed))?;
        Ok(())
    }

    fn read_record(&mut self, email: &str) -> Result<Option<String>, error::BoardstackError> {
        let out = self.psql(&format!(
            "SELECT id || '|' || email || '|' || username FROM users WHERE email = {}",
            sql_quote(email)
        ))?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    fn count_records(&mut self, email: &str) -> Result<i64, error::BoardstackError> {
        let out = self.psql(&format!(
            "SELECT COUNT(*) FROM users WHERE email = {}",
            sql_quote(email)
        ))?;
        parse_count(&out)
    }

    fn cache_set(&mut self, key: &str, value: &str) -> Result<(), error::BoardstackError> {
        let cache_service = self.settings().cache_service.clone();
        let argv = self.redis_cli(&["SET", key, value])?;
        let out = self.exec(&cache_service, &argv)?;
        if out.trim() != "OK" {
            return Err(error::BoardstackError::RuntimeError(format!(
                "SET {} answered '{}'",
                key,
                out.trim()
            )));
        }
        Ok(())
    }

    fn cache_get(&mut self, key: &str) -> Result<Option<String>, error::BoardstackError> {
        let cache_service = self.settings().cache_service.clone();
        let argv = self.redis_cli(&["GET", key])?;
        let out = self.exec(&cache_service, &argv)?;
        let out = out.trim();
        Ok(if out.is_empty() {
            None
        } else {
            Some(out.to_string())
        })
    }

    fn restart(&mut self, services: &[String]) -> Result<String, error::BoardstackError> {
        let mut action = vec!["restart".to_string()];
        action.extend(services.iter().cloned());
        self.runner.run_checked(&action)?;
        Ok(format!("restarted {}", services.join(", ")))
    }
}

// ===== CLI =====

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TargetKind {
    Docker,
    Local,
}

#[derive(Parser, Debug)]
#[clap(name = "smoke", about = "Check that data survives a restart of the backing services")]
pub struct SmokeCli {
    #[clap(long, value_enum, default_value = "docker")]
    pub target: TargetKind,
    /// Override both settle waits (seconds).
    #[clap(long)]
    pub settle: Option<u64>,
}

/// Runs the smoke test and prints its report. A failed run is an error so
/// the process exits non-zero.
pub fn run_smoke_cli(
    project: &Project,
    store: &Store,
    cli: SmokeCli,
) -> Result<(), error::BoardstackError> {
    let env = project.env()?;
    let mut settings = project.config.smoke.clone();
    if let Some(secs) = cli.settle {
        settings.settle_seconds = secs;
        settings.restart_settle_seconds = secs;
    }

    let report = match cli.target {
        TargetKind::Local => {
            let mut target = LocalTarget::new(store.clone(), project.config.clone(), env);
            run_smoke(&mut target, &settings)
        }
        TargetKind::Docker => {
            let runner = ComposeRunner::detect(project)?;
            let mut target = DockerTarget::new(project.clone(), env, runner);
            run_smoke(&mut target, &settings)
        }
    };

    for step in &report.steps {
        let mark = if step.status == "ok" {
            "ok".green()
        } else {
            "FAILED".red().bold()
        };
        eprintln!("[{}] {:<14} {}", mark, step.step, step.detail);
    }

    let status = if report.passed { "ok" } else { "failed" };
    let out = time::command_envelope("smoke", status, json!({ "report": report }));
    println!("{}", serde_json::to_string_pretty(&out)?);

    match report.failed_step() {
        None if report.passed => Ok(()),
        Some(step) => Err(error::BoardstackError::RuntimeError(format!(
            "smoke test failed at '{}': {}",
            step.step, step.detail
        ))),
        None => Err(error::BoardstackError::RuntimeError(
            "smoke test failed".to_string(),
        )),
    }
}
