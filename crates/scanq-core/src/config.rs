//! Service configuration.
//!
//! Loaded once at startup and immutable for the daemon's lifetime. The
//! on-disk dialect (`ConfigFile`) keeps the field names existing service
//! configs use; `resolve()` validates it into the `Duration`-typed
//! `ServiceConfig` the rest of the crate consumes. Any invalid value is
//! fatal: the daemon refuses to start rather than run half-configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::device::DevicePreference;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file is not valid JSON: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("check_interval must be greater than zero")]
    ZeroInterval,

    #[error("max_concurrent_tasks must be at least 1")]
    ZeroConcurrency,

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("unrecognized device preference: {0:?}")]
    BadDevice(String),

    #[error("engine.command must not be empty")]
    EmptyEngineCommand,

    #[error("engine.command is required to run the service")]
    MissingEngineCommand,

    #[error("cannot create queue directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// On-disk configuration dialect.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,

    #[serde(default = "default_tasks_directory")]
    pub tasks_directory: PathBuf,

    #[serde(default = "default_processed_directory")]
    pub processed_directory: PathBuf,

    #[serde(default = "default_failed_directory")]
    pub failed_directory: PathBuf,

    /// Poll cadence in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Default 1: the engine typically monopolizes one accelerator.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_device")]
    pub device: String,

    /// Dead-letter threshold.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Claims abandoned by a crashed run are requeued once older than
    /// this many seconds.
    #[serde(default = "default_stale_claim_grace")]
    pub stale_claim_grace: u64,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub engine: Option<EngineConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfigFile {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Per-task wall-clock budget in seconds.
    #[serde(default = "default_engine_timeout")]
    pub timeout: u64,
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("./scanq")
}
fn default_tasks_directory() -> PathBuf {
    PathBuf::from("tasks")
}
fn default_processed_directory() -> PathBuf {
    PathBuf::from("processed")
}
fn default_failed_directory() -> PathBuf {
    PathBuf::from("failed")
}
fn default_check_interval() -> u64 {
    30
}
fn default_max_concurrent_tasks() -> usize {
    1
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_stale_claim_grace() -> u64 {
    300
}
fn default_engine_timeout() -> u64 {
    3600
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            tasks_directory: default_tasks_directory(),
            processed_directory: default_processed_directory(),
            failed_directory: default_failed_directory(),
            check_interval: default_check_interval(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            device: default_device(),
            max_attempts: default_max_attempts(),
            stale_claim_grace: default_stale_claim_grace(),
            log_file: None,
            engine: None,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate and resolve into the immutable runtime configuration.
    pub fn resolve(self) -> Result<ServiceConfig, ConfigError> {
        if self.check_interval == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        let device_preference = DevicePreference::parse(&self.device)
            .ok_or_else(|| ConfigError::BadDevice(self.device.clone()))?;

        let engine = match self.engine {
            None => None,
            Some(engine) => {
                if engine.command.trim().is_empty() {
                    return Err(ConfigError::EmptyEngineCommand);
                }
                Some(EngineConfig {
                    command: engine.command,
                    args: engine.args,
                    timeout: Duration::from_secs(engine.timeout),
                })
            }
        };

        let base = self.base_directory;
        let under_base = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        Ok(ServiceConfig {
            tasks_dir: under_base(self.tasks_directory),
            // Sibling of the queue directories so claim renames stay on
            // one filesystem.
            inflight_dir: base.join("inflight"),
            processed_dir: under_base(self.processed_directory),
            failed_dir: under_base(self.failed_directory),
            log_file: self.log_file.map(under_base),
            base_dir: base,
            poll_interval: Duration::from_secs(self.check_interval),
            max_concurrent_tasks: self.max_concurrent_tasks,
            device_preference,
            max_attempts: self.max_attempts,
            stale_claim_grace: Duration::from_secs(self.stale_claim_grace),
            engine,
        })
    }
}

/// Validated, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub inflight_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub device_preference: DevicePreference,
    pub max_attempts: u32,
    pub stale_claim_grace: Duration,
    pub log_file: Option<PathBuf>,
    pub engine: Option<EngineConfig>,
}

/// Out-of-process engine invocation settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ServiceConfig {
    /// Load and resolve a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        ConfigFile::load(path)?.resolve()
    }

    /// Create the queue directories this configuration points at.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.tasks_dir,
            &self.inflight_dir,
            &self.processed_dir,
            &self.failed_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
