//! Configuration resolution for kbroker.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/kbroker/broker.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete kbroker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Known interpreters keyed by the name clients select them with.
    #[serde(default)]
    pub interpreters: BTreeMap<String, InterpreterConfig>,
    /// Interpreter used when a client does not select one.
    #[serde(default)]
    pub default_interpreter: Option<String>,
}

/// HTTP listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 5444)),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Defaults applied to every worker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root under which each user gets a working directory.
    pub working_root: PathBuf,
    /// Directory passed to workers for their own log files.
    pub log_dir: PathBuf,
    /// Log level passed to workers.
    pub worker_log_level: String,
    /// Seconds to wait for graceful worker shutdown before a hard kill.
    pub terminate_timeout_secs: u64,
    /// Largest frame accepted from a worker or a client.
    pub max_frame_bytes: usize,
    /// Launch workers under the requesting user's OS account.
    pub impersonate_users: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let base = data_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            working_root: base.join("sessions"),
            log_dir: base.join("logs"),
            worker_log_level: "info".to_string(),
            terminate_timeout_secs: 5,
            max_frame_bytes: 64 * 1024 * 1024, // 64 MB
            impersonate_users: false,
        }
    }
}

/// One selectable interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// Path to the worker host executable.
    pub path: PathBuf,
    /// Arguments always passed before the per-session ones.
    #[serde(default)]
    pub args: Vec<String>,
}

impl BrokerConfig {
    /// Resolve an interpreter by name, falling back to the default.
    pub fn interpreter(&self, selector: Option<&str>) -> Option<(&str, &InterpreterConfig)> {
        let name = selector
            .filter(|s| !s.is_empty())
            .or(self.default_interpreter.as_deref())?;
        self.interpreters
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<BrokerConfig> {
    let mut config = BrokerConfig::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kbroker").join("broker.json"))
}

/// Default base directory for session working dirs and worker logs.
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("kbroker"))
}

fn load_config_file(path: &Path) -> Result<BrokerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut BrokerConfig, overlay: BrokerConfig) {
    base.server = overlay.server;
    base.sessions = overlay.sessions;
    base.interpreters.extend(overlay.interpreters);
    if overlay.default_interpreter.is_some() {
        base.default_interpreter = overlay.default_interpreter;
    }
}

fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(val) = std::env::var("KBROKER_ADDR")
        && let Ok(addr) = val.parse()
    {
        config.server.addr = addr;
    }
    if let Ok(val) = std::env::var("KBROKER_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Ok(val) = std::env::var("KBROKER_WORKING_ROOT") {
        config.sessions.working_root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("KBROKER_TERMINATE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.sessions.terminate_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("KBROKER_DEFAULT_INTERPRETER") {
        config.default_interpreter = Some(val);
    }
}
