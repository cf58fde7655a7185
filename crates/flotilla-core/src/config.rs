//! Configuration: one toml file plus a couple of env overrides.
//!
//! # Lookup order
//! 1. explicit path (`--config`)
//! 2. `FLOTILLA_CONFIG`
//! 3. `./flotilla.toml`
//! 4. built-in defaults
//!
//! `FLOTILLA_REDIS_URL` and `FLOTILLA_LOG` override the file afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ports::AdmissionLimits;
use crate::ports::mq::{DEFAULT_MAX_QUEUED, DEFAULT_MAX_RUNNING};

pub const CONFIG_ENV: &str = "FLOTILLA_CONFIG";
pub const REDIS_URL_ENV: &str = "FLOTILLA_REDIS_URL";
pub const LOG_ENV: &str = "FLOTILLA_LOG";
pub const DEFAULT_CONFIG_FILE: &str = "flotilla.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlotillaConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default = "default_operators")]
    pub operators: Vec<OperatorConfig>,

    #[serde(default = "default_operator_id")]
    pub default_operator: String,
}

impl Default for FlotillaConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            master: MasterConfig::default(),
            ssh: SshConfig::default(),
            worker: WorkerConfig::default(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
            operators: default_operators(),
            default_operator: default_operator_id(),
        }
    }
}

fn default_operator_id() -> String {
    "local".to_string()
}

fn default_operators() -> Vec<OperatorConfig> {
    vec![OperatorConfig {
        id: default_operator_id(),
        kind: "in-process".to_string(),
        name: Some("in-process ssh".to_string()),
        redis_url: None,
        list: None,
    }]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `None` keeps the queue in memory (single process only).
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    #[serde(default = "default_max_running")]
    pub max_running: usize,
}

fn default_namespace() -> String {
    "flotilla".to_string()
}

fn default_max_queued() -> usize {
    DEFAULT_MAX_QUEUED
}

fn default_max_running() -> usize {
    DEFAULT_MAX_RUNNING
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: default_namespace(),
            max_queued: default_max_queued(),
            max_running: default_max_running(),
        }
    }
}

impl QueueConfig {
    pub fn limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_queued: self.max_queued,
            max_running: self.max_running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub hold_interval_ms: u64,

    #[serde(default = "default_archive_attempts")]
    pub archive_attempts: u32,

    #[serde(default = "default_archive_backoff_ms")]
    pub archive_backoff_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_archive_attempts() -> u32 {
    3
}

fn default_archive_backoff_ms() -> u64 {
    500
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_interval_ms(),
            hold_interval_ms: default_interval_ms(),
            archive_attempts: default_archive_attempts(),
            archive_backoff_ms: default_archive_backoff_ms(),
        }
    }
}

impl MasterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hold_interval(&self) -> Duration {
        Duration::from_millis(self.hold_interval_ms)
    }

    pub fn archive_backoff(&self) -> Duration {
        Duration::from_millis(self.archive_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    /// Remote login; `None` uses the ssh client default.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Directory for ControlMaster sockets; `None` uses the OS temp dir.
    #[serde(default)]
    pub control_dir: Option<PathBuf>,

    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,

    /// Extra `-o` options passed verbatim.
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_control_persist_secs() -> u64 {
    60
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            user: None,
            port: default_ssh_port(),
            key_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            control_dir: None,
            control_persist_secs: default_control_persist_secs(),
            options: Vec::new(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("flotilla-ssh"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Broker operator whose list this worker consumes; defaults to
    /// `default_operator`.
    #[serde(default)]
    pub operator: Option<String>,

    #[serde(default = "default_block_timeout_secs")]
    pub block_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_block_timeout_secs() -> u64 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            operator: None,
            block_timeout_secs: default_block_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON store directory; `None` keeps everything in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// EnvFilter directive, e.g. "info" or "flotilla_core=debug".
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// One dispatch backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub id: String,

    /// Registry key: `in-process` or `redis-broker`.
    pub kind: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Broker connection; defaults to `queue.redis_url`.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Broker list; defaults to `{namespace}:dispatch:{id}`.
    #[serde(default)]
    pub list: Option<String>,
}

impl FlotillaConfig {
    /// Resolve the config file, parse it and apply env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => match std::env::var(CONFIG_ENV) {
                Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v)),
                _ => {
                    let local = Path::new(DEFAULT_CONFIG_FILE);
                    local.exists().then(|| local.to_path_buf())
                }
            },
        };

        let mut cfg = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(REDIS_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.queue.redis_url = Some(url);
        }
        if let Some(level) = lookup(LOG_ENV).filter(|v| !v.trim().is_empty()) {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_queued == 0 || self.queue.max_running == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_queued and queue.max_running must be positive".to_string(),
            ));
        }
        if self.master.archive_attempts == 0 {
            return Err(ConfigError::Invalid(
                "master.archive_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for op in &self.operators {
            if !seen.insert(op.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "operator id {:?} is defined twice",
                    op.id
                )));
            }
        }
        if !seen.contains(self.default_operator.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default_operator {:?} is not defined",
                self.default_operator
            )));
        }
        Ok(())
    }

    pub fn operator(&self, id: &str) -> Option<&OperatorConfig> {
        self.operators.iter().find(|op| op.id == id)
    }

    /// Redis list a broker operator pushes to.
    pub fn broker_list(&self, op: &OperatorConfig) -> String {
        op.list
            .clone()
            .unwrap_or_else(|| format!("{}:dispatch:{}", self.queue.namespace, op.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = FlotillaConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.queue.limits(), AdmissionLimits::default());
        assert_eq!(cfg.master.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.operator("local").unwrap().kind, "in-process");
    }

    #[test]
    fn parses_a_full_file() {
        let cfg = FlotillaConfig::from_toml(
            r#"
default_operator = "fleet"

[queue]
redis_url = "redis://10.0.0.5/"
namespace = "prod"
max_queued = 20

[master]
poll_interval_ms = 250

[ssh]
user = "deploy"
key_file = "/etc/flotilla/id_ed25519"
options = ["StrictHostKeyChecking=no"]

[log]
level = "flotilla_core=debug"
format = "json"

[[operators]]
id = "fleet"
kind = "redis-broker"

[[operators]]
id = "local"
kind = "in-process"
"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.queue.namespace, "prod");
        assert_eq!(cfg.queue.max_queued, 20);
        assert_eq!(cfg.queue.max_running, DEFAULT_MAX_RUNNING);
        assert_eq!(cfg.master.hold_interval_ms, 1000);
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.log.format, LogFormat::Json);
        let fleet = cfg.operator("fleet").unwrap();
        assert_eq!(cfg.broker_list(fleet), "prod:dispatch:fleet");
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = FlotillaConfig::default();
        cfg.apply_env_overrides(|key| match key {
            REDIS_URL_ENV => Some("redis://override/".to_string()),
            LOG_ENV => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(cfg.queue.redis_url.as_deref(), Some("redis://override/"));
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut cfg = FlotillaConfig::default();
        cfg.apply_env_overrides(|_| Some("  ".to_string()));
        assert_eq!(cfg.queue.redis_url, None);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn unknown_default_operator_is_rejected() {
        let mut cfg = FlotillaConfig::default();
        cfg.default_operator = "nope".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_operator_ids_are_rejected() {
        let mut cfg = FlotillaConfig::default();
        cfg.operators.push(cfg.operators[0].clone());
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_missing_file_is_a_read_error() {
        let err = FlotillaConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(&path, "[queue]\nmax_running = 3\n").unwrap();

        let cfg = FlotillaConfig::from_file(&path).unwrap();
        assert_eq!(cfg.queue.max_running, 3);
    }
}
