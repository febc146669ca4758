//! Configuration resolution for yafaas.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Config file (`--config path.json`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete yafaas configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub worker: WorkerSettings,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            worker: WorkerSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// HTTP front end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Grace period for in-flight requests once shutdown begins.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerSettings {
    /// `host:port` string used for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What the host does when the worker exits without being asked to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashPolicy {
    /// Log and terminate the host process.
    #[default]
    Exit,
    /// Hand the fault to the embedding code and keep the host alive.
    Report,
}

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Executable started as the worker.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Environment variable carrying the host's callback address.
    pub callback_env: String,
    /// Extra variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Prefix relayed output lines with the program name.
    pub log_prefix: bool,
    /// Longest relayed output line in bytes; `0` disables the limit.
    pub max_log_line_bytes: usize,
    /// Seconds between the interrupt and a forced kill.
    pub terminate_timeout_secs: u64,
    pub crash_policy: CrashPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("node"),
            args: Vec::new(),
            working_dir: None,
            callback_env: "EVENTS_API".to_string(),
            env: BTreeMap::new(),
            log_prefix: true,
            max_log_line_bytes: 64 * 1024, // 64 KiB
            terminate_timeout_secs: 5,
            crash_policy: CrashPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Load configuration: defaults, then the optional file, then environment.
///
/// A file path that was given explicitly must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `YAFAAS_*` overrides. Unparseable numeric values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("YAFAAS_HOST") {
        config.server.host = val;
    }
    if let Some(n) = lookup("YAFAAS_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = n;
    }
    if let Some(n) = lookup("YAFAAS_SHUTDOWN_GRACE_SECS").and_then(|v| v.parse().ok()) {
        config.server.shutdown_grace_secs = n;
    }
    if let Some(val) = lookup("YAFAAS_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = lookup("YAFAAS_WORKER_PROGRAM") {
        config.worker.program = PathBuf::from(val);
    }
}
