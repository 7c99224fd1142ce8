//! Orchestration descriptor: service definitions, validation, start order,
//! Compose rendering and the operator surface around `docker compose`.

use crate::core::config::{BoardstackConfig, Project, StackSection};
use crate::core::env::EnvContext;
use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use crate::plugins::health::{self, ProbeState};
use crate::plugins::proxy;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependsCondition {
    ServiceStarted,
    ServiceHealthy,
    ServiceCompletedSuccessfully,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthProbe {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    #[serde(default = "default_start_period")]
    pub start_period: String,
}

fn default_start_period() -> String {
    "0s".to_string()
}

impl HealthProbe {
    pub fn interval(&self) -> Result<Duration, error::BoardstackError> {
        parse_duration(&self.interval)
    }

    pub fn timeout(&self) -> Result<Duration, error::BoardstackError> {
        parse_duration(&self.timeout)
    }

    pub fn start_period(&self) -> Result<Duration, error::BoardstackError> {
        parse_duration(&self.start_period)
    }

    /// Latest point after container start by which the probe must report
    /// healthy: `start_period + retries * interval`.
    pub fn deadline(&self) -> Result<Duration, error::BoardstackError> {
        let start_period = self.start_period()?;
        self.interval()?
            .checked_mul(self.retries)
            .and_then(|waited| start_period.checked_add(waited))
            .ok_or_else(|| {
                error::BoardstackError::ValidationError(format!(
                    "health deadline overflows (start_period {} + {} x {})",
                    self.start_period, self.retries, self.interval
                ))
            })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub subnet: Option<String>,
}

fn default_driver() -> String {
    "bridge".to_string()
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: "boardnet".to_string(),
            driver: default_driver(),
            subnet: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub depends_on: BTreeMap<String, DependsCondition>,
    #[serde(default)]
    pub healthcheck: Option<HealthProbe>,
    #[serde(default)]
    pub restart: Option<String>,
}

pub const DEFAULT_RESTART_POLICY: &str = "unless-stopped";

// ===== Value parsing =====

/// Parses Compose durations: `30s`, `1m30s`, `500ms`, `1h`, `250us`.
pub fn parse_duration(input: &str) -> Result<Duration, error::BoardstackError> {
    let invalid =
        || error::BoardstackError::ValidationError(format!("invalid duration '{}'", input));
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            "ms" => Some(Duration::from_millis(value)),
            "us" => Some(Duration::from_micros(value)),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| {
                error::BoardstackError::ValidationError(format!("duration '{}' overflows", input))
            })?;
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Named(String),
    Bind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

/// Parses short-syntax volume mounts: `name:/path`, `./host:/path:ro`.
pub fn parse_mount(spec: &str) -> Result<Mount, error::BoardstackError> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => {
            return Err(error::BoardstackError::ValidationError(format!(
                "volume '{}' must be 'source:/target[:mode]'",
                spec
            )));
        }
    };
    if source.is_empty() || !target.starts_with('/') {
        return Err(error::BoardstackError::ValidationError(format!(
            "volume '{}' needs a source and an absolute container path",
            spec
        )));
    }
    let read_only = match mode {
        None | Some("rw") | Some("z") | Some("Z") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(error::BoardstackError::ValidationError(format!(
                "volume '{}' has unknown mode '{}'",
                spec, other
            )));
        }
    };
    let source = if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
        MountSource::Bind(source.to_string())
    } else {
        MountSource::Named(source.to_string())
    };
    Ok(Mount {
        source,
        target: target.to_string(),
        read_only,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host: Option<u16>,
    pub container: u16,
    pub protocol: String,
}

/// Parses `[ip:]host:container[/proto]` or a bare container port.
pub fn parse_port(spec: &str) -> Result<PortMapping, error::BoardstackError> {
    let invalid = |why: &str| {
        error::BoardstackError::ValidationError(format!("port '{}': {}", spec, why))
    };
    let (mapping, protocol) = match spec.split_once('/') {
        Some((m, p)) if p == "tcp" || p == "udp" => (m, p.to_string()),
        Some(_) => return Err(invalid("protocol must be tcp or udp")),
        None => (spec, "tcp".to_string()),
    };
    let port = |raw: &str| -> Result<u16, error::BoardstackError> {
        match raw.parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(invalid("ports must be 1-65535")),
        }
    };

    let parts: Vec<&str> = mapping.split(':').collect();
    match parts.as_slice() {
        [container] => Ok(PortMapping {
            host_ip: None,
            host: None,
            container: port(container)?,
            protocol,
        }),
        [host, container] => Ok(PortMapping {
            host_ip: None,
            host: Some(port(host)?),
            container: port(container)?,
            protocol,
        }),
        [ip, host, container] => {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| invalid("host ip must be an IPv4 address"))?;
            Ok(PortMapping {
                host_ip: Some(ip.to_string()),
                host: Some(port(host)?),
                container: port(container)?,
                protocol,
            })
        }
        _ => Err(invalid("expected [ip:]host:container")),
    }
}

/// Validates an IPv4 CIDR such as `172.28.0.0/16`.
pub fn parse_subnet(cidr: &str) -> Result<(Ipv4Addr, u8), error::BoardstackError> {
    let invalid = || error::BoardstackError::ValidationError(format!("invalid subnet '{}'", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    if u32::from(addr) & !mask != 0 {
        return Err(error::BoardstackError::ValidationError(format!(
            "subnet '{}' has host bits set",
            cidr
        )));
    }
    Ok((addr, prefix))
}

// ===== Validation =====

/// Checks the descriptor for well-formedness. Returns every problem found;
/// an empty list means the stack is valid.
pub fn validate_stack(config: &BoardstackConfig, env: &EnvContext) -> Vec<String> {
    let mut issues = Vec::new();

    if config.services.is_empty() {
        issues.push("stack declares no services".to_string());
        return issues;
    }

    let mut names = BTreeSet::new();
    for svc in &config.services {
        if svc.name.trim().is_empty() {
            issues.push("service with empty name".to_string());
        } else if !names.insert(svc.name.as_str()) {
            issues.push(format!("duplicate service name '{}'", svc.name));
        }
    }

    let declared_volumes: BTreeSet<&str> =
        config.stack.volumes.iter().map(String::as_str).collect();
    let mut volume_owner: BTreeMap<String, String> = BTreeMap::new();
    let mut host_ports: BTreeMap<(Option<String>, u16, String), String> = BTreeMap::new();

    for svc in &config.services {
        let name = &svc.name;
        if svc.image.as_deref().unwrap_or("").trim().is_empty()
            && svc.build.as_deref().unwrap_or("").trim().is_empty()
        {
            issues.push(format!("service '{}' needs an image or a build context", name));
        }

        for (key, value) in &svc.environment {
            if let Err(e) = env.substitute(value) {
                issues.push(format!("service '{}' env {}: {}", name, key, e));
            }
        }

        for raw in &svc.ports {
            let resolved = match env.substitute(raw) {
                Ok(v) => v,
                Err(e) => {
                    issues.push(format!("service '{}': {}", name, e));
                    continue;
                }
            };
            match parse_port(&resolved) {
                Ok(p) => {
                    if let Some(host) = p.host {
                        let key = (p.host_ip.clone(), host, p.protocol.clone());
                        if let Some(other) = host_ports.insert(key, name.clone()) {
                            issues.push(format!(
                                "host port {} published by both '{}' and '{}'",
                                host, other, name
                            ));
                        }
                    }
                }
                Err(e) => issues.push(format!("service '{}': {}", name, e)),
            }
        }

        for raw in &svc.volumes {
            match parse_mount(raw) {
                Ok(Mount {
                    source: MountSource::Named(vol),
                    ..
                }) => {
                    if !declared_volumes.contains(vol.as_str()) {
                        issues.push(format!(
                            "service '{}' mounts undeclared volume '{}'",
                            name, vol
                        ));
                    }
                    if let Some(other) = volume_owner.insert(vol.clone(), name.clone()) {
                        if other != *name {
                            issues.push(format!(
                                "volume '{}' mounted by both '{}' and '{}'",
                                vol, other, name
                            ));
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => issues.push(format!("service '{}': {}", name, e)),
            }
        }

        if let Some(probe) = &svc.healthcheck {
            if probe.test.is_empty() {
                issues.push(format!("service '{}' healthcheck has an empty test", name));
            }
            if probe.retries == 0 {
                issues.push(format!("service '{}' healthcheck retries must be >= 1", name));
            }
            let mut durations_ok = true;
            for (field, value) in [
                ("interval", &probe.interval),
                ("timeout", &probe.timeout),
                ("start_period", &probe.start_period),
            ] {
                if let Err(e) = parse_duration(value) {
                    durations_ok = false;
                    issues.push(format!("service '{}' healthcheck {}: {}", name, field, e));
                }
            }
            if durations_ok {
                if let Err(e) = probe.deadline() {
                    issues.push(format!("service '{}' healthcheck: {}", name, e));
                }
            }
        }

        for (dep, condition) in &svc.depends_on {
            if dep == name {
                issues.push(format!("service '{}' depends on itself", name));
                continue;
            }
            match config.service(dep) {
                None => issues.push(format!(
                    "service '{}' depends on unknown service '{}'",
                    name, dep
                )),
                Some(target) => {
                    if *condition == DependsCondition::ServiceHealthy
                        && target.healthcheck.is_none()
                    {
                        issues.push(format!(
                            "service '{}' waits for '{}' to be healthy but '{}' declares no \
                             healthcheck",
                            name, dep, dep
                        ));
                    }
                }
            }
        }
    }

    for vol in &config.stack.volumes {
        if !volume_owner.contains_key(vol) {
            issues.push(format!("volume '{}' is declared but never mounted", vol));
        }
    }

    if let Some(subnet) = &config.network.subnet {
        if let Err(e) = parse_subnet(subnet) {
            issues.push(e.to_string());
        }
    }

    if let Err(e) = startup_order(config) {
        if !matches!(e, error::BoardstackError::NotFound(_)) {
            issues.push(e.to_string());
        }
    }

    issues
}

pub fn ensure_valid(
    config: &BoardstackConfig,
    env: &EnvContext,
) -> Result<(), error::BoardstackError> {
    let issues = validate_stack(config, env);
    if issues.is_empty() {
        return Ok(());
    }
    Err(error::BoardstackError::ConfigError(format!(
        "{} problem(s) in stack descriptor:\n  - {}",
        issues.len(),
        issues.join("\n  - ")
    )))
}

/// Deterministic topological start order; ties break by service name.
pub fn startup_order(config: &BoardstackConfig) -> Result<Vec<String>, error::BoardstackError> {
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for svc in &config.services {
        let mut deps = BTreeSet::new();
        for dep in svc.depends_on.keys() {
            if config.service(dep).is_none() {
                return Err(error::BoardstackError::NotFound(format!(
                    "service '{}' depends on unknown service '{}'",
                    svc.name, dep
                )));
            }
            deps.insert(dep.as_str());
        }
        pending.insert(svc.name.as_str(), deps);
    }

    let mut order = Vec::with_capacity(pending.len());
    loop {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        let next = ready[0];
        pending.remove(next);
        for deps in pending.values_mut() {
            deps.remove(next);
        }
        order.push(next.to_string());
    }

    if !pending.is_empty() {
        let cycle: Vec<&str> = pending.keys().copied().collect();
        return Err(error::BoardstackError::ValidationError(format!(
            "dependency cycle between services: {}",
            cycle.join(", ")
        )));
    }
    Ok(order)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeDeadline {
    pub service: String,
    pub deadline_seconds: u64,
}

/// Health deadline per service that declares a probe, in start order.
pub fn health_deadlines(
    config: &BoardstackConfig,
) -> Result<Vec<ProbeDeadline>, error::BoardstackError> {
    let mut out = Vec::new();
    for name in startup_order(config)? {
        if let Some(probe) = config.service(&name).and_then(|s| s.healthcheck.as_ref()) {
            out.push(ProbeDeadline {
                service: name.clone(),
                deadline_seconds: probe.deadline()?.as_secs(),
            });
        }
    }
    Ok(out)
}

// ===== Compose file model =====

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EnvDecl {
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    List(Vec<String>),
}

impl Default for EnvDecl {
    fn default() -> Self {
        EnvDecl::Map(BTreeMap::new())
    }
}

impl EnvDecl {
    fn is_empty(&self) -> bool {
        match self {
            EnvDecl::Map(m) => m.is_empty(),
            EnvDecl::List(l) => l.is_empty(),
        }
    }

    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            EnvDecl::Map(m) => m
                .into_iter()
                .map(|(k, v)| (k, v.map(|v| yaml_scalar(&v)).unwrap_or_default()))
                .collect(),
            EnvDecl::List(l) => l
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry, String::new()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DependsEntry {
    #[serde(default = "default_condition")]
    pub condition: DependsCondition,
}

fn default_condition() -> DependsCondition {
    DependsCondition::ServiceStarted
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum DependsDecl {
    Map(BTreeMap<String, DependsEntry>),
    List(Vec<String>),
}

impl Default for DependsDecl {
    fn default() -> Self {
        DependsDecl::Map(BTreeMap::new())
    }
}

impl DependsDecl {
    fn is_empty(&self) -> bool {
        match self {
            DependsDecl::Map(m) => m.is_empty(),
            DependsDecl::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ComposeHealthcheck {
    pub test: StringOrList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "EnvDecl::is_empty")]
    pub environment: EnvDecl,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "DependsDecl::is_empty")]
    pub depends_on: DependsDecl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<ComposeHealthcheck>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ComposeFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub services: BTreeMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_yaml::Value>,
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn yaml_get<'a>(map: &'a serde_yaml::Mapping, key: &str) -> Option<&'a serde_yaml::Value> {
    map.get(serde_yaml::Value::String(key.to_string()))
}

/// Long-syntax ports (`{target, published}`) collapse to the short form.
fn port_to_short(value: &serde_yaml::Value) -> Result<String, error::BoardstackError> {
    match value {
        serde_yaml::Value::Mapping(map) => {
            let target = yaml_get(map, "target").map(yaml_scalar).ok_or_else(|| {
                error::BoardstackError::ValidationError(
                    "long-syntax port without target".to_string(),
                )
            })?;
            Ok(match yaml_get(map, "published").map(yaml_scalar) {
                Some(published) if !published.is_empty() => format!("{}:{}", published, target),
                _ => target,
            })
        }
        other => Ok(yaml_scalar(other)),
    }
}

/// Long-syntax mounts (`{type, source, target, read_only}`) collapse to the short form.
fn mount_to_short(value: &serde_yaml::Value) -> Result<String, error::BoardstackError> {
    match value {
        serde_yaml::Value::Mapping(map) => {
            let source = yaml_get(map, "source").map(yaml_scalar).unwrap_or_default();
            let target = yaml_get(map, "target").map(yaml_scalar).ok_or_else(|| {
                error::BoardstackError::ValidationError(
                    "long-syntax volume without target".to_string(),
                )
            })?;
            let ro = yaml_get(map, "read_only")
                .and_then(serde_yaml::Value::as_bool)
                .unwrap_or(false);
            Ok(if ro {
                format!("{}:{}:ro", source, target)
            } else {
                format!("{}:{}", source, target)
            })
        }
        other => Ok(yaml_scalar(other)),
    }
}

pub fn compose_file(config: &BoardstackConfig) -> ComposeFile {
    let network = &config.network;
    let mut services = BTreeMap::new();

    for svc in &config.services {
        let depends_on = svc
            .depends_on
            .iter()
            .map(|(dep, condition)| {
                (
                    dep.clone(),
                    DependsEntry {
                        condition: *condition,
                    },
                )
            })
            .collect();

        let healthcheck = svc.healthcheck.as_ref().map(|probe| ComposeHealthcheck {
            test: StringOrList::Many(probe.test.clone()),
            interval: Some(probe.interval.clone()),
            timeout: Some(probe.timeout.clone()),
            retries: Some(probe.retries),
            start_period: Some(probe.start_period.clone()),
        });

        let service = ComposeService {
            image: svc.image.clone(),
            build: svc.build.clone().map(serde_yaml::Value::String),
            command: svc.command.clone().map(StringOrList::Many),
            restart: Some(
                svc.restart
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RESTART_POLICY.to_string()),
            ),
            ports: svc.ports.iter().cloned().map(serde_yaml::Value::String).collect(),
            environment: EnvDecl::Map(
                svc.environment
                    .iter()
                    .map(|(k, v)| (k.clone(), Some(serde_yaml::Value::String(v.clone()))))
                    .collect(),
            ),
            volumes: svc.volumes.iter().cloned().map(serde_yaml::Value::String).collect(),
            networks: Some(serde_yaml::Value::Sequence(vec![serde_yaml::Value::String(
                network.name.clone(),
            )])),
            depends_on: DependsDecl::Map(depends_on),
            healthcheck,
        };
        services.insert(svc.name.clone(), service);
    }

    let mut net = serde_yaml::Mapping::new();
    net.insert("driver".into(), network.driver.clone().into());
    if let Some(subnet) = &network.subnet {
        let mut pool = serde_yaml::Mapping::new();
        pool.insert("subnet".into(), subnet.clone().into());
        let mut ipam = serde_yaml::Mapping::new();
        ipam.insert(
            "config".into(),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(pool)]),
        );
        net.insert("ipam".into(), serde_yaml::Value::Mapping(ipam));
    }

    ComposeFile {
        name: Some(config.stack.name.clone()),
        services,
        networks: BTreeMap::from([(network.name.clone(), serde_yaml::Value::Mapping(net))]),
        volumes: config
            .stack
            .volumes
            .iter()
            .map(|v| (v.clone(), serde_yaml::Value::Mapping(serde_yaml::Mapping::new())))
            .collect(),
    }
}

pub const COMPOSE_HEADER: &str =
    "# Generated by boardstack from boardstack.toml. Edit the descriptor, not this file.\n";

pub fn render_compose(config: &BoardstackConfig) -> Result<String, error::BoardstackError> {
    let body = serde_yaml::to_string(&compose_file(config))?;
    Ok(format!("{}{}", COMPOSE_HEADER, body))
}

pub fn parse_compose(yaml: &str) -> Result<ComposeFile, error::BoardstackError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Lifts a Compose file back into the descriptor model so the same
/// validation runs over hand-written files.
pub fn config_from_compose(
    compose: ComposeFile,
) -> Result<BoardstackConfig, error::BoardstackError> {
    let mut network = NetworkSpec::default();
    if let Some((name, value)) = compose.networks.iter().next() {
        network.name = name.clone();
        if let serde_yaml::Value::Mapping(map) = value {
            if let Some(driver) = yaml_get(map, "driver") {
                network.driver = yaml_scalar(driver);
            }
            network.subnet = yaml_get(map, "ipam")
                .and_then(serde_yaml::Value::as_mapping)
                .and_then(|ipam| yaml_get(ipam, "config"))
                .and_then(serde_yaml::Value::as_sequence)
                .and_then(|pools| pools.first())
                .and_then(serde_yaml::Value::as_mapping)
                .and_then(|pool| yaml_get(pool, "subnet"))
                .map(yaml_scalar);
        }
    }

    let mut services = Vec::with_capacity(compose.services.len());
    for (name, svc) in compose.services {
        let depends_on = match svc.depends_on {
            DependsDecl::Map(m) => m.into_iter().map(|(k, v)| (k, v.condition)).collect(),
            DependsDecl::List(l) => l
                .into_iter()
                .map(|k| (k, DependsCondition::ServiceStarted))
                .collect(),
        };
        let healthcheck = svc.healthcheck.map(|hc| HealthProbe {
            test: hc.test.into_vec(),
            interval: hc.interval.unwrap_or_else(|| "30s".to_string()),
            timeout: hc.timeout.unwrap_or_else(|| "30s".to_string()),
            retries: hc.retries.unwrap_or(3),
            start_period: hc.start_period.unwrap_or_else(default_start_period),
        });
        let build = svc.build.map(|b| match b {
            serde_yaml::Value::Mapping(ref map) => yaml_get(map, "context")
                .map(yaml_scalar)
                .unwrap_or_else(|| ".".to_string()),
            other => yaml_scalar(&other),
        });

        services.push(ServiceSpec {
            name,
            image: svc.image,
            build,
            command: svc.command.map(StringOrList::into_vec),
            ports: svc
                .ports
                .iter()
                .map(port_to_short)
                .collect::<Result<Vec<_>, _>>()?,
            environment: svc.environment.into_map(),
            volumes: svc
                .volumes
                .iter()
                .map(mount_to_short)
                .collect::<Result<Vec<_>, _>>()?,
            depends_on,
            healthcheck,
            restart: svc.restart,
        });
    }

    Ok(BoardstackConfig {
        stack: StackSection {
            name: compose.name.unwrap_or_else(|| "compose".to_string()),
            compose_file: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
            deploy_dir: "deploy".to_string(),
            volumes: compose.volumes.keys().cloned().collect(),
        },
        network,
        services,
        proxy: Default::default(),
        smoke: Default::default(),
    })
}

/// Writes the compose file, `init.sql`, and `nginx.conf` for the project.
pub fn render_all(
    project: &Project,
    env: &EnvContext,
) -> Result<Vec<PathBuf>, error::BoardstackError> {
    let deploy = project.deploy_dir();
    fs::create_dir_all(deploy.join("certs"))?;

    let compose_path = project.compose_path();
    fs::write(&compose_path, render_compose(&project.config)?)?;

    let init_sql = deploy.join("init.sql");
    fs::write(&init_sql, schemas::POSTGRES_INIT_SQL)?;

    let proxy_spec = proxy::resolve(&project.config.proxy, env)?;
    let nginx_conf = deploy.join("nginx.conf");
    fs::write(&nginx_conf, proxy::render_nginx_conf(&proxy_spec)?)?;

    Ok(vec![compose_path, init_sql, nginx_conf])
}

// ===== Runtime =====

pub fn command_exists(cmd: &str) -> bool {
    Command::new(cmd)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn find_container_runtime() -> Result<String, error::BoardstackError> {
    if let Ok(runtime) = std::env::var("BOARDSTACK_RUNTIME") {
        if !runtime.trim().is_empty() {
            return Ok(runtime);
        }
    }
    for candidate in ["docker", "podman"] {
        if command_exists(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(error::BoardstackError::NotFound(
        "No container runtime found (docker/podman)".to_string(),
    ))
}

/// Drives `<runtime> compose` against the project's rendered compose file.
#[derive(Debug, Clone)]
pub struct ComposeRunner {
    pub runtime: String,
    pub project_dir: PathBuf,
    pub compose_file: PathBuf,
    pub project_name: String,
}

impl ComposeRunner {
    pub fn detect(project: &Project) -> Result<Self, error::BoardstackError> {
        Ok(Self::with_runtime(project, find_container_runtime()?))
    }

    pub fn with_runtime(project: &Project, runtime: String) -> Self {
        Self {
            runtime,
            project_dir: project.root.clone(),
            compose_file: project.compose_path(),
            project_name: project.config.stack.name.clone(),
        }
    }

    pub fn args(&self, action: &[String]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.to_string_lossy().to_string(),
            "-p".to_string(),
            self.project_name.clone(),
        ];
        args.extend(action.iter().cloned());
        args
    }

    pub fn output(&self, action: &[String]) -> Result<Output, error::BoardstackError> {
        Command::new(&self.runtime)
            .args(self.args(action))
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(error::BoardstackError::IoError)
    }

    /// Runs the action and returns stdout; non-zero exit becomes an error
    /// carrying stderr.
    pub fn run_checked(&self, action: &[String]) -> Result<String, error::BoardstackError> {
        let output = self.output(action)?;
        if !output.status.success() {
            return Err(error::BoardstackError::RuntimeError(format!(
                "{} compose {} failed (exit {:?}): {}",
                self.runtime,
                action.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `inspect` record of one container, straight from the runtime.
    pub fn inspect(&self, container: &str) -> Result<serde_json::Value, error::BoardstackError> {
        let output = Command::new(&self.runtime)
            .args(["inspect", container])
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(error::BoardstackError::IoError)?;
        if !output.status.success() {
            return Err(error::BoardstackError::RuntimeError(format!(
                "{} inspect {} failed: {}",
                self.runtime,
                container,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let records: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)?;
        records.into_iter().next().ok_or_else(|| {
            error::BoardstackError::NotFound(format!("container '{}'", container))
        })
    }

    /// Runs the action with `input` on its stdin and returns stdout.
    pub fn run_with_input(
        &self,
        action: &[String],
        input: &[u8],
    ) -> Result<String, error::BoardstackError> {
        let mut child = Command::new(&self.runtime)
            .args(self.args(action))
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(error::BoardstackError::IoError)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(error::BoardstackError::RuntimeError(format!(
                "{} compose {} failed (exit {:?}): {}",
                self.runtime,
                action.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Runs the action with the terminal attached (logs, interactive output).
    pub fn run_attached(&self, action: &[String]) -> Result<(), error::BoardstackError> {
        let status = Command::new(&self.runtime)
            .args(self.args(action))
            .current_dir(&self.project_dir)
            .status()
            .map_err(error::BoardstackError::IoError)?;
        if !status.success() {
            return Err(error::BoardstackError::RuntimeError(format!(
                "{} compose {} exited with {:?}",
                self.runtime,
                action.join(" "),
                status.code()
            )));
        }
        Ok(())
    }
}

/// `exec -T <service> <cmd...>`: runs a command in a service container
/// without a TTY.
pub fn exec_args(service: &str, cmd: &[String]) -> Vec<String> {
    let mut action = vec!["exec".to_string(), "-T".to_string(), service.to_string()];
    action.extend(cmd.iter().cloned());
    action
}

/// A service's environment value with `${VAR}` references resolved.
pub fn service_env(
    config: &BoardstackConfig,
    env: &EnvContext,
    service: &str,
    key: &str,
) -> Result<Option<String>, error::BoardstackError> {
    match config.service(service).and_then(|s| s.environment.get(key)) {
        Some(raw) => Ok(Some(env.substitute(raw)?)),
        None => Ok(None),
    }
}

/// Login the database service's client tools should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresLogin {
    pub service: String,
    pub user: String,
    pub database: String,
}

impl PostgresLogin {
    /// `POSTGRES_USER` (default `postgres`) and `POSTGRES_DB` (default: the
    /// user name) from the service's environment.
    pub fn from_config(
        config: &BoardstackConfig,
        env: &EnvContext,
        service: &str,
    ) -> Result<Self, error::BoardstackError> {
        let user = service_env(config, env, service, "POSTGRES_USER")?
            .unwrap_or_else(|| "postgres".to_string());
        let database =
            service_env(config, env, service, "POSTGRES_DB")?.unwrap_or_else(|| user.clone());
        Ok(Self {
            service: service.to_string(),
            user,
            database,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackAction {
    Up,
    Down,
    Rebuild,
    Logs {
        service: Option<String>,
        tail: u32,
        follow: bool,
    },
    Status,
    ValidateConfig,
}

pub fn action_args(action: &StackAction) -> Vec<String> {
    let args: Vec<&str> = match action {
        StackAction::Up => vec!["up", "-d"],
        // Named volumes survive `down`; only `down -v` would drop them.
        StackAction::Down => vec!["down"],
        StackAction::Rebuild => vec!["up", "-d", "--build", "--force-recreate"],
        StackAction::Status => vec!["ps", "--all", "--format", "json"],
        StackAction::ValidateConfig => vec!["config", "--quiet"],
        StackAction::Logs {
            service,
            tail,
            follow,
        } => {
            let mut out = vec!["logs".to_string(), "--tail".to_string(), tail.to_string()];
            if *follow {
                out.push("--follow".to_string());
            }
            if let Some(service) = service {
                out.push(service.clone());
            }
            return out;
        }
    };
    args.into_iter().map(String::from).collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service: String,
    /// Container id as reported by `ps`; empty when the runtime omits it.
    pub container: String,
    pub state: String,
    pub health: ProbeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parses `compose ps --format json`, which is a JSON array on older
/// releases and one object per line on newer ones.
pub fn parse_ps_output(raw: &str) -> Result<Vec<ServiceStatus>, error::BoardstackError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut out: Vec<ServiceStatus> = rows
        .iter()
        .map(|row| {
            let state = row["State"].as_str().unwrap_or("unknown").to_string();
            ServiceStatus {
                service: row["Service"].as_str().unwrap_or("").to_string(),
                container: row["ID"].as_str().unwrap_or("").to_string(),
                health: ProbeState::from_docker_status(
                    row["Health"].as_str().unwrap_or(""),
                    &state,
                ),
                state,
                reason: None,
            }
        })
        .collect();
    out.sort_by(|a, b| a.service.cmp(&b.service));
    Ok(out)
}

// ===== CLI =====

#[derive(Parser, Debug)]
#[clap(name = "stack", about = "Validate, render, and operate the service stack")]
pub struct StackCli {
    #[clap(subcommand)]
    pub command: StackCommand,
}

#[derive(Subcommand, Debug)]
pub enum StackCommand {
    /// Validate the descriptor (or an existing compose file).
    Validate {
        /// Validate this compose file instead of boardstack.toml.
        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Write docker-compose.yml, deploy/init.sql and deploy/nginx.conf.
    Render,
    /// Print the dependency-respecting start order.
    Order,
    /// Print each service's health deadline (start_period + retries * interval).
    Deadlines,
    /// Print the rendered reverse-proxy configuration.
    Proxy,
    /// Start every service in the background.
    Up,
    /// Stop and remove containers; named volumes are kept.
    Down,
    /// Rebuild images and recreate containers.
    Rebuild,
    /// Show service logs.
    Logs {
        service: Option<String>,
        #[clap(long, default_value_t = 200)]
        tail: u32,
        #[clap(long, short)]
        follow: bool,
    },
    /// Show container state and health per service.
    Status,
}

pub fn run_stack_cli(project: &Project, cli: StackCli) -> Result<(), error::BoardstackError> {
    let env = project.env()?;
    let out = match cli.command {
        StackCommand::Validate { file } => {
            let (config, source) = match file {
                Some(path) => {
                    let raw = fs::read_to_string(&path)?;
                    (config_from_compose(parse_compose(&raw)?)?, path)
                }
                None => (
                    project.config.clone(),
                    project.root.join(crate::core::config::CONFIG_FILE),
                ),
            };
            let issues = validate_stack(&config, &env);
            let status = if issues.is_empty() { "ok" } else { "error" };
            let envelope = time::command_envelope(
                "stack.validate",
                status,
                json!({
                    "source": source,
                    "services": config.services.len(),
                    "issues": issues,
                }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if !issues.is_empty() {
                return Err(error::BoardstackError::ConfigError(format!(
                    "{} problem(s) found",
                    issues.len()
                )));
            }
            return Ok(());
        }
        StackCommand::Render => {
            ensure_valid(&project.config, &env)?;
            let written = render_all(project, &env)?;
            time::command_envelope("stack.render", "ok", json!({ "written": written }))
        }
        StackCommand::Order => {
            let order = startup_order(&project.config)?;
            time::command_envelope("stack.order", "ok", json!({ "order": order }))
        }
        StackCommand::Deadlines => {
            let deadlines = health_deadlines(&project.config)?;
            time::command_envelope("stack.deadlines", "ok", json!({ "deadlines": deadlines }))
        }
        StackCommand::Proxy => {
            let spec = proxy::resolve(&project.config.proxy, &env)?;
            print!("{}", proxy::render_nginx_conf(&spec)?);
            return Ok(());
        }
        StackCommand::Up => bring_up(project, &env, StackAction::Up, "stack.up")?,
        StackCommand::Rebuild => bring_up(project, &env, StackAction::Rebuild, "stack.rebuild")?,
        StackCommand::Down => {
            let runner = ComposeRunner::detect(project)?;
            runner.run_attached(&action_args(&StackAction::Down))?;
            time::command_envelope("stack.down", "ok", json!({ "runtime": runner.runtime }))
        }
        StackCommand::Logs {
            service,
            tail,
            follow,
        } => {
            let runner = ComposeRunner::detect(project)?;
            runner.run_attached(&action_args(&StackAction::Logs {
                service,
                tail,
                follow,
            }))?;
            return Ok(());
        }
        StackCommand::Status => {
            let runner = ComposeRunner::detect(project)?;
            let raw = runner.run_checked(&action_args(&StackAction::Status))?;
            let mut services = parse_ps_output(&raw)?;
            let now = Utc::now();
            for svc in services.iter_mut() {
                let probe = project
                    .config
                    .service(&svc.service)
                    .and_then(|s| s.healthcheck.as_ref());
                let Some(probe) = probe else { continue };
                if svc.health != ProbeState::Starting || svc.container.is_empty() {
                    continue;
                }
                let container = runner.inspect(&svc.container)?;
                health::judge_starting(svc, probe, &container, now)?;
            }
            let all_healthy = !services.is_empty()
                && services.iter().all(|s| s.health == ProbeState::Healthy);
            let summary = health::summarize(&services);
            time::command_envelope(
                "stack.status",
                if all_healthy { "ok" } else { "degraded" },
                json!({ "services": services, "summary": summary }),
            )
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn bring_up(
    project: &Project,
    env: &EnvContext,
    action: StackAction,
    cmd: &str,
) -> Result<serde_json::Value, error::BoardstackError> {
    ensure_valid(&project.config, env)?;
    render_all(project, env)?;
    let runner = ComposeRunner::detect(project)?;
    runner.run_attached(&action_args(&action))?;
    Ok(time::command_envelope(
        cmd,
        "ok",
        json!({ "runtime": runner.runtime, "order": startup_order(&project.config)? }),
    ))
}
