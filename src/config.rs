// SPDX-License-Identifier: Apache-2.0
//!
//! Orchestrator configuration loaded from layered YAML.
//!
//! Configuration is YAML, deep-merged across layers — later layers override
//! only the fields they set. Search order (later overrides earlier):
//! 1. built-in defaults
//! 2. `/etc/conclave/orchestrator.yaml`
//! 3. `~/.config/conclave/orchestrator.yaml`
//! 4. the path given to [`load`] via `--config`
//! 5. `CONCLAVE_AGENT_PORT` / `CONCLAVE_CLIENT_PORT` / `CONCLAVE_SERVICE_PORT`
//!    environment variables, overriding just the port of their bind address.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use conclave_tsp::LaunchSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

fn default_agent_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_client_bind() -> String {
    "127.0.0.1:3001".to_string()
}
fn default_service_bind() -> String {
    "127.0.0.1:3002".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_tool_timeout_secs() -> u64 {
    60
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_agent_bind")]
    pub agent_bind: String,
    #[serde(default = "default_client_bind")]
    pub client_bind: String,
    #[serde(default = "default_service_bind")]
    pub service_bind: String,

    /// Passed straight to `tracing_subscriber::EnvFilter` unless `-v`/`-vv`
    /// raises it on the command line.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Deadline for a correlated request/response round trip that doesn't
    /// name its own timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Deadline for `mcp.tool.execute`.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Directory entries registered before any peer connects, keyed by name.
    /// A live peer that later registers under the same name offlines the
    /// placeholder per the registries' name-collision rule.
    #[serde(default)]
    pub preconfigured_agents: HashMap<String, PreconfiguredPeer>,
    #[serde(default)]
    pub preconfigured_services: HashMap<String, PreconfiguredPeer>,

    /// Tool servers the TSP adapter registers at startup, keyed by name.
    /// Connection is lazy — `ensure_connected` spawns the subprocess on
    /// first `mcp.tool.execute`, not at load time.
    #[serde(default)]
    pub tool_servers: HashMap<String, LaunchSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_bind: default_agent_bind(),
            client_bind: default_client_bind(),
            service_bind: default_service_bind(),
            log_level: default_log_level(),
            default_timeout_secs: default_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            preconfigured_agents: HashMap::new(),
            preconfigured_services: HashMap::new(),
            tool_servers: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// A directory entry for a peer that hasn't connected yet: its advertised
/// capabilities and manifest, without an identity or connection binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreconfiguredPeer {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub manifest: Value,
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/conclave/orchestrator.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/conclave/orchestrator.yaml"));
    }
    paths
}

/// Loads config from the built-in defaults, the standard search paths, an
/// optional explicit `--config` path, then applies port-only env overrides.
pub fn load(extra: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading orchestrator config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit orchestrator config");
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: OrchestratorConfig =
        if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
            OrchestratorConfig::default()
        } else {
            serde_yaml::from_value(merged).with_context(|| "deserializing merged orchestrator config")?
        };

    apply_port_env_override(&mut config.agent_bind, "CONCLAVE_AGENT_PORT");
    apply_port_env_override(&mut config.client_bind, "CONCLAVE_CLIENT_PORT");
    apply_port_env_override(&mut config.service_bind, "CONCLAVE_SERVICE_PORT");

    Ok(config)
}

/// Replaces the port suffix of a `host:port` bind address with the value of
/// `var`, leaving the host untouched. Invalid or unset env vars are ignored.
fn apply_port_env_override(bind: &mut String, var: &str) {
    let Ok(raw) = std::env::var(var) else { return };
    let Ok(port) = raw.parse::<u16>() else {
        debug!(var, raw, "ignoring non-numeric port override");
        return;
    };
    if let Some((host, _)) = bind.rsplit_once(':') {
        *bind = format!("{host}:{port}");
    }
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}
