//! `${VAR}` substitution for descriptor values.
//!
//! Values resolve from the process environment first, then the project `.env`
//! file. Supported forms follow Compose:
//! - `${VAR}` / `$VAR`: required, error when unset
//! - `${VAR:-default}`: default when unset or empty
//! - `${VAR-default}`: default when unset
//! - `$$`: literal `$`

use crate::core::error::BoardstackError;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?)-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("static regex")
    })
}

#[derive(Debug, Clone, Default)]
pub struct EnvContext {
    file_vars: BTreeMap<String, String>,
    use_process_env: bool,
}

impl EnvContext {
    /// Context backed by the process environment and, when present, `env_file`.
    pub fn load(env_file: &Path) -> Result<Self, BoardstackError> {
        let mut file_vars = BTreeMap::new();
        if env_file.exists() {
            let iter = dotenv::from_path_iter(env_file).map_err(|e| {
                BoardstackError::ConfigError(format!("{}: {}", env_file.display(), e))
            })?;
            for item in iter {
                let (key, value) = item.map_err(|e| {
                    BoardstackError::ConfigError(format!("{}: {}", env_file.display(), e))
                })?;
                file_vars.insert(key, value);
            }
        }
        Ok(Self {
            file_vars,
            use_process_env: true,
        })
    }

    /// Context that only sees the given variables (no process environment).
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            file_vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            use_process_env: false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        if self.use_process_env {
            if let Ok(value) = std::env::var(name) {
                return Some(value);
            }
        }
        self.file_vars.get(name).cloned()
    }

    pub fn substitute(&self, input: &str) -> Result<String, BoardstackError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in var_pattern().captures_iter(input) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&input[last..whole.start()]);
            last = whole.end();

            if whole.as_str() == "$$" {
                out.push('$');
                continue;
            }

            let name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = self.lookup(name);

            match caps.get(3) {
                Some(default) => {
                    let empty_counts_as_unset = caps.get(2).is_some_and(|m| m.as_str() == ":");
                    let resolved = match value {
                        Some(v) if !(empty_counts_as_unset && v.is_empty()) => v,
                        _ => default.as_str().to_string(),
                    };
                    out.push_str(&resolved);
                }
                None => match value {
                    Some(v) => out.push_str(&v),
                    None => {
                        return Err(BoardstackError::ConfigError(format!(
                            "variable '{}' is not set and has no default (in '{}')",
                            name, input
                        )));
                    }
                },
            }
        }

        out.push_str(&input[last..]);
        Ok(out)
    }
}
