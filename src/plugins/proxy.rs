//! Reverse-proxy configuration: routes inbound traffic to the app tier.

use crate::core::env::EnvContext;
use crate::core::error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    /// `host:port` reachable on the stack network.
    pub server: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub upstream: String,
    #[serde(default)]
    pub websocket: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProxySpec {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    #[serde(default = "default_body_size_mb")]
    pub client_max_body_size_mb: u32,
    #[serde(default = "default_upstreams", rename = "upstream")]
    pub upstreams: Vec<Upstream>,
    #[serde(default = "default_routes", rename = "route")]
    pub routes: Vec<Route>,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

// Matches the backend's upload limit.
fn default_body_size_mb() -> u32 {
    50
}

fn default_upstreams() -> Vec<Upstream> {
    vec![
        Upstream {
            name: "backend".to_string(),
            server: "backend:8000".to_string(),
        },
        Upstream {
            name: "frontend".to_string(),
            server: "frontend:3000".to_string(),
        },
    ]
}

fn default_routes() -> Vec<Route> {
    vec![
        Route {
            prefix: "/api/".to_string(),
            upstream: "backend".to_string(),
            websocket: false,
        },
        Route {
            prefix: "/ws/".to_string(),
            upstream: "backend".to_string(),
            websocket: true,
        },
        Route {
            prefix: "/".to_string(),
            upstream: "frontend".to_string(),
            websocket: false,
        },
    ]
}

impl Default for ProxySpec {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            tls_cert_path: None,
            tls_key_path: None,
            client_max_body_size_mb: default_body_size_mb(),
            upstreams: default_upstreams(),
            routes: default_routes(),
        }
    }
}

impl ProxySpec {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Substitutes environment references; empty TLS paths mean "no TLS".
pub fn resolve(spec: &ProxySpec, env: &EnvContext) -> Result<ProxySpec, error::BoardstackError> {
    let optional = |value: &Option<String>| -> Result<Option<String>, error::BoardstackError> {
        match value {
            Some(v) => {
                let resolved = env.substitute(v)?;
                Ok(if resolved.trim().is_empty() {
                    None
                } else {
                    Some(resolved)
                })
            }
            None => Ok(None),
        }
    };

    let mut upstreams = Vec::with_capacity(spec.upstreams.len());
    for up in &spec.upstreams {
        upstreams.push(Upstream {
            name: up.name.clone(),
            server: env.substitute(&up.server)?,
        });
    }

    Ok(ProxySpec {
        server_name: env.substitute(&spec.server_name)?,
        tls_cert_path: optional(&spec.tls_cert_path)?,
        tls_key_path: optional(&spec.tls_key_path)?,
        client_max_body_size_mb: spec.client_max_body_size_mb,
        upstreams,
        routes: spec.routes.clone(),
    })
}

pub fn validate_proxy(spec: &ProxySpec) -> Vec<String> {
    let mut issues = Vec::new();

    if spec.server_name.trim().is_empty() {
        issues.push("proxy server_name is empty".to_string());
    }
    if spec.tls_cert_path.is_some() != spec.tls_key_path.is_some() {
        issues.push("TLS needs both a certificate and a key path".to_string());
    }

    let mut upstream_names = BTreeSet::new();
    for up in &spec.upstreams {
        if up.name.trim().is_empty() {
            issues.push("upstream with empty name".to_string());
        } else if !upstream_names.insert(up.name.as_str()) {
            issues.push(format!("duplicate upstream '{}'", up.name));
        }
        let port_ok = up
            .server
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0))
            .unwrap_or(false);
        if !port_ok {
            issues.push(format!(
                "upstream '{}' server '{}' must be host:port",
                up.name, up.server
            ));
        }
    }

    if spec.routes.is_empty() {
        issues.push("proxy declares no routes".to_string());
    }
    let mut prefixes = BTreeSet::new();
    for route in &spec.routes {
        if !route.prefix.starts_with('/') {
            issues.push(format!("route prefix '{}' must start with '/'", route.prefix));
        }
        if !prefixes.insert(route.prefix.as_str()) {
            issues.push(format!("duplicate route prefix '{}'", route.prefix));
        }
        if !upstream_names.contains(route.upstream.as_str()) {
            issues.push(format!(
                "route '{}' targets unknown upstream '{}'",
                route.prefix, route.upstream
            ));
        }
    }

    issues
}

fn write_locations(out: &mut String, spec: &ProxySpec) -> std::fmt::Result {
    writeln!(out, "        location = /health {{")?;
    writeln!(out, "            access_log off;")?;
    writeln!(out, "            add_header Content-Type text/plain;")?;
    writeln!(out, "            return 200 \"ok\\n\";")?;
    writeln!(out, "        }}")?;

    for route in &spec.routes {
        writeln!(out)?;
        writeln!(out, "        location {} {{", route.prefix)?;
        writeln!(out, "            proxy_pass http://{};", route.upstream)?;
        writeln!(out, "            proxy_http_version 1.1;")?;
        writeln!(out, "            proxy_set_header Host $host;")?;
        writeln!(out, "            proxy_set_header X-Real-IP $remote_addr;")?;
        writeln!(
            out,
            "            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        )?;
        writeln!(out, "            proxy_set_header X-Forwarded-Proto $scheme;")?;
        if route.websocket {
            writeln!(out, "            proxy_set_header Upgrade $http_upgrade;")?;
            writeln!(out, "            proxy_set_header Connection $connection_upgrade;")?;
            writeln!(out, "            proxy_read_timeout 3600s;")?;
        }
        writeln!(out, "        }}")?;
    }
    Ok(())
}

fn render(spec: &ProxySpec) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "# Generated by boardstack. Edit [proxy] in boardstack.toml instead.")?;
    writeln!(out, "worker_processes auto;")?;
    writeln!(out)?;
    writeln!(out, "events {{")?;
    writeln!(out, "    worker_connections 1024;")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    writeln!(out, "http {{")?;
    writeln!(out, "    include /etc/nginx/mime.types;")?;
    writeln!(out, "    default_type application/octet-stream;")?;
    writeln!(out, "    sendfile on;")?;
    writeln!(out, "    keepalive_timeout 65;")?;
    writeln!(out, "    client_max_body_size {}m;", spec.client_max_body_size_mb)?;
    writeln!(out)?;
    writeln!(out, "    map $http_upgrade $connection_upgrade {{")?;
    writeln!(out, "        default upgrade;")?;
    writeln!(out, "        ''      close;")?;
    writeln!(out, "    }}")?;

    for up in &spec.upstreams {
        writeln!(out)?;
        writeln!(out, "    upstream {} {{", up.name)?;
        writeln!(out, "        server {};", up.server)?;
        writeln!(out, "    }}")?;
    }

    writeln!(out)?;
    writeln!(out, "    server {{")?;
    writeln!(out, "        listen 80;")?;
    writeln!(out, "        server_name {};", spec.server_name)?;
    writeln!(out)?;
    if spec.tls_enabled() {
        writeln!(out, "        location = /health {{")?;
        writeln!(out, "            access_log off;")?;
        writeln!(out, "            return 200 \"ok\\n\";")?;
        writeln!(out, "        }}")?;
        writeln!(out)?;
        writeln!(out, "        location / {{")?;
        writeln!(out, "            return 301 https://$host$request_uri;")?;
        writeln!(out, "        }}")?;
    } else {
        write_locations(&mut out, spec)?;
    }
    writeln!(out, "    }}")?;

    if let (Some(cert), Some(key)) = (&spec.tls_cert_path, &spec.tls_key_path) {
        writeln!(out)?;
        writeln!(out, "    server {{")?;
        writeln!(out, "        listen 443 ssl;")?;
        writeln!(out, "        http2 on;")?;
        writeln!(out, "        server_name {};", spec.server_name)?;
        writeln!(out, "        ssl_certificate {};", cert)?;
        writeln!(out, "        ssl_certificate_key {};", key)?;
        writeln!(out, "        ssl_protocols TLSv1.2 TLSv1.3;")?;
        writeln!(out)?;
        write_locations(&mut out, spec)?;
        writeln!(out, "    }}")?;
    }

    writeln!(out, "}}")?;
    Ok(out)
}

/// Renders `nginx.conf` for an already-resolved spec.
pub fn render_nginx_conf(spec: &ProxySpec) -> Result<String, error::BoardstackError> {
    let issues = validate_proxy(spec);
    if !issues.is_empty() {
        return Err(error::BoardstackError::ConfigError(format!(
            "proxy configuration: {}",
            issues.join("; ")
        )));
    }
    render(spec).map_err(|e| error::BoardstackError::RuntimeError(e.to_string()))
}
