//! Load settings from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bus_core::config::{
    BusConfiguration, ConfigError, Limits, ListenSpec, DEFAULT_AUTH_TIMEOUT_MS,
    DEFAULT_MAX_COMPLETED_CONNECTIONS, DEFAULT_MAX_INCOMPLETE_CONNECTIONS,
};
use bus_core::AccessPolicy;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_LOG: &str = "bus_daemon=info,bus_core=info";

/// Daemon settings. File: ~/.config/bus-daemon/config.toml or /etc/bus-daemon/config.toml.
/// Env overrides: BUS_DAEMON_LISTEN (`;`-separated), BUS_DAEMON_AUTH_TIMEOUT,
/// BUS_DAEMON_MAX_INCOMPLETE, BUS_DAEMON_MAX_COMPLETED, BUS_DAEMON_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Listen specs, e.g. `tcp:addr=0.0.0.0,port=9955`.
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u32,
    #[serde(default = "default_max_incomplete")]
    pub max_incomplete_connections: u32,
    #[serde(default = "default_max_completed")]
    pub max_completed_connections: u32,
    /// `tracing` filter directives.
    #[serde(default = "default_log")]
    pub log: String,
    /// How long shutdown waits for open connections to close.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_listen() -> Vec<String> {
    vec![
        "unix:abstract=alljoyn".to_string(),
        "tcp:addr=0.0.0.0,port=9955".to_string(),
    ]
}
fn default_auth_timeout() -> u32 {
    DEFAULT_AUTH_TIMEOUT_MS
}
fn default_max_incomplete() -> u32 {
    DEFAULT_MAX_INCOMPLETE_CONNECTIONS
}
fn default_max_completed() -> u32 {
    DEFAULT_MAX_COMPLETED_CONNECTIONS
}
fn default_log() -> String {
    DEFAULT_LOG.to_string()
}
fn default_shutdown_grace() -> u64 {
    2000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_timeout_ms: default_auth_timeout(),
            max_incomplete_connections: default_max_incomplete(),
            max_completed_connections: default_max_completed(),
            log: default_log(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Settings {
    pub fn limits(&self) -> Limits {
        Limits {
            auth_timeout_ms: self.auth_timeout_ms,
            max_incomplete_connections: self.max_incomplete_connections,
            max_completed_connections: self.max_completed_connections,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Bus configuration for a standalone daemon: these listeners and limits,
    /// wildcard-allow policy.
    pub fn bus_configuration(&self) -> Result<BusConfiguration, ConfigError> {
        let mut builder = BusConfiguration::builder()
            .limits(self.limits())
            .policy(AccessPolicy::allow_all());
        for spec in &self.listen {
            builder = builder.listen(spec.parse::<ListenSpec>()?);
        }
        builder.build()
    }

    /// Parse one TOML settings file.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let s = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&s).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `var`. Unparsable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("BUS_DAEMON_LISTEN") {
            let specs: Vec<String> = s
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
            if specs.is_empty() {
                warn!("BUS_DAEMON_LISTEN is empty, ignored");
            } else {
                self.listen = specs;
            }
        }
        override_u32(&var, "BUS_DAEMON_AUTH_TIMEOUT", &mut self.auth_timeout_ms);
        override_u32(&var, "BUS_DAEMON_MAX_INCOMPLETE", &mut self.max_incomplete_connections);
        override_u32(&var, "BUS_DAEMON_MAX_COMPLETED", &mut self.max_completed_connections);
        if let Some(s) = var("BUS_DAEMON_LOG") {
            self.log = s;
        }
    }
}

fn override_u32(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut u32) {
    if let Some(s) = var(key) {
        match s.trim().parse::<u32>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %s, "invalid environment override, ignored"),
        }
    }
}

/// Load settings: defaults, then the first config file found, then env vars.
pub fn load() -> Settings {
    let mut s = load_file().unwrap_or_default();
    s.apply_env(|k| std::env::var(k).ok());
    s
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bus-daemon/config.toml"));
    }
    out.push(PathBuf::from("/etc/bus-daemon/config.toml"));
    out
}

fn load_file() -> Option<Settings> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match Settings::load_from(&path) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "ignoring settings file");
            None
        }
    }
}
