//! Project configuration (`boardstack.toml`).

use crate::core::assets;
use crate::core::env::EnvContext;
use crate::core::error::BoardstackError;
use crate::core::store::PROJECT_DIR;
use crate::plugins::compose::{NetworkSpec, ServiceSpec};
use crate::plugins::proxy::ProxySpec;
use crate::plugins::smoke::SmokeSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "boardstack.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackSection {
    pub name: String,
    #[serde(default = "default_compose_file")]
    pub compose_file: String,
    #[serde(default = "default_env_file")]
    pub env_file: String,
    #[serde(default = "default_deploy_dir")]
    pub deploy_dir: String,
    /// Named volumes managed by the orchestrator.
    #[serde(default)]
    pub volumes: Vec<String>,
}

fn default_compose_file() -> String {
    "docker-compose.yml".to_string()
}

fn default_env_file() -> String {
    ".env".to_string()
}

fn default_deploy_dir() -> String {
    "deploy".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardstackConfig {
    pub stack: StackSection,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub proxy: ProxySpec,
    #[serde(default)]
    pub smoke: SmokeSettings,
}

impl BoardstackConfig {
    pub fn from_toml(content: &str) -> Result<Self, BoardstackError> {
        Ok(toml::from_str(content)?)
    }

    /// The embedded default descriptor: six services, four volumes, one network.
    pub fn default_stack() -> Result<Self, BoardstackError> {
        Self::from_toml(assets::TEMPLATE_BOARDSTACK_TOML)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// A loaded project: its root directory plus the parsed descriptor.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: BoardstackConfig,
}

impl Project {
    pub fn load(root: &Path) -> Result<Self, BoardstackError> {
        let path = root.join(CONFIG_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            BoardstackError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = BoardstackConfig::from_toml(&content)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn env(&self) -> Result<EnvContext, BoardstackError> {
        EnvContext::load(&self.root.join(&self.config.stack.env_file))
    }

    pub fn compose_path(&self) -> PathBuf {
        self.root.join(&self.config.stack.compose_file)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.root.join(&self.config.stack.deploy_dir)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR).join("backups")
    }
}

/// Walks up from `start_dir` to the first directory holding `boardstack.toml`.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, BoardstackError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(CONFIG_FILE).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(BoardstackError::NotFound(format!(
                "'{}' not found in current or parent directories. Run `boardstack init` first.",
                CONFIG_FILE
            )));
        }
    }
}

/// File name a template is written to inside a project.
pub fn template_target(name: &str) -> String {
    match name {
        "env.example" => ".env.example".to_string(),
        other => other.to_string(),
    }
}

/// Writes the default descriptor and env example into `dir`.
/// Existing files are left alone unless `force` is set.
pub fn write_default_config(dir: &Path, force: bool) -> Result<Vec<PathBuf>, BoardstackError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for name in assets::list_templates() {
        let template = assets::get_template(name).ok_or_else(|| {
            BoardstackError::NotFound(format!("embedded template '{}'", name))
        })?;
        let path = dir.join(template_target(name));
        if path.exists() && !force {
            continue;
        }
        fs::write(&path, template)?;
        written.push(path);
    }
    Ok(written)
}
