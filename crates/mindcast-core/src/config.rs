//! Configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_CAPACITY;

/// Top-level Mindcast configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<BusConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Pending requests older than this are dropped (0 = keep forever).
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,

    /// How often the pending-request sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_pending_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redis URL of a shared bus. Without it the bus is in-process only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    #[serde(default = "default_tasks_channel")]
    pub tasks_channel: String,

    #[serde(default = "default_results_channel")]
    pub results_channel: String,

    #[serde(default = "default_updates_channel")]
    pub updates_channel: String,
}

fn default_bus_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_tasks_channel() -> String {
    "tasks".into()
}

fn default_results_channel() -> String {
    "task_results".into()
}

fn default_updates_channel() -> String {
    "mind_updates".into()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            capacity: default_bus_capacity(),
            tasks_channel: default_tasks_channel(),
            results_channel: default_results_channel(),
            updates_channel: default_updates_channel(),
        }
    }
}

/// Names of the three fixed bus channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Gateway -> executor.
    pub tasks: String,
    /// Executor -> result relay.
    pub results: String,
    /// Any publisher -> result relay.
    pub updates: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        BusConfig::default().channels()
    }
}

impl BusConfig {
    pub fn channels(&self) -> ChannelNames {
        ChannelNames {
            tasks: self.tasks_channel.clone(),
            results: self.results_channel.clone(),
            updates: self.updates_channel.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Run the task worker inside the gateway process.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the CRUD backend the executor forwards actions to.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_backend_url() -> String {
    "http://localhost:8001".into()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: default_backend_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "mindcast_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::MindcastError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::MindcastError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_dir() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Age after which an unanswered request is forgotten; `None` disables sweeping.
    pub fn pending_ttl(&self) -> Option<Duration> {
        let secs = self
            .gateway
            .as_ref()
            .map(|g| g.pending_ttl_secs)
            .unwrap_or_else(default_pending_ttl_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        let secs = self
            .gateway
            .as_ref()
            .map(|g| g.sweep_interval_secs)
            .unwrap_or_else(default_sweep_interval_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Networked bus URL; `None` means the in-process bus. Empty strings count as unset.
    pub fn bus_url(&self) -> Option<String> {
        self.bus
            .as_ref()
            .and_then(|b| b.url.clone())
            .filter(|url| !url.is_empty())
    }

    pub fn bus_capacity(&self) -> usize {
        self.bus.as_ref().map(|b| b.capacity).unwrap_or(DEFAULT_CAPACITY)
    }

    pub fn channels(&self) -> ChannelNames {
        self.bus.as_ref().map(BusConfig::channels).unwrap_or_default()
    }

    pub fn worker(&self) -> WorkerConfig {
        self.worker.clone().unwrap_or_default()
    }
}

/// Resolve the data directory (~/.mindcast).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mindcast")
}
