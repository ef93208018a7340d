//! Runtime configuration
//!
//! Values come from [`VaultConfig::default`], then an optional JSON file, then
//! `DRIVESPLIT_*` environment variables.

use crate::planner::ChunkPolicy;
use crate::storage::{AccountId, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "DRIVESPLIT_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// A directory-backed account served by the local adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccountConfig {
    pub account_id: AccountId,
    pub quota_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub chunk_policy: ChunkPolicy,
    pub default_strategy: String,
    /// Global ceiling on concurrent remote operations
    pub max_parallel_transfers: usize,
    /// Per-account operations per second, 0 for unlimited
    pub account_ops_per_second: u32,
    pub processing_workers: usize,
    pub retry: RetryPolicy,
    pub upload_idle_timeout_secs: u64,
    pub download_stall_timeout_secs: u64,
    pub artifact_ttl_secs: u64,
    pub session_retention_secs: u64,
    pub reaper_interval_secs: u64,
    pub work_dir: PathBuf,
    pub database_url: String,
    pub storage_root: PathBuf,
    pub storage_accounts: Vec<StorageAccountConfig>,
    pub listen_addr: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::default(),
            default_strategy: crate::planner::BALANCED.to_string(),
            max_parallel_transfers: num_cpus::get() * 2,
            account_ops_per_second: 0,
            processing_workers: num_cpus::get(),
            retry: RetryPolicy::default(),
            upload_idle_timeout_secs: 60 * 60,
            download_stall_timeout_secs: 15 * 60,
            artifact_ttl_secs: 60 * 60,
            session_retention_secs: 24 * 60 * 60,
            reaper_interval_secs: 60,
            work_dir: std::env::temp_dir().join("drivesplit"),
            database_url: "sqlite://drivesplit.db".to_string(),
            storage_root: PathBuf::from("./drivesplit-accounts"),
            storage_accounts: Vec::new(),
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl VaultConfig {
    /// Defaults, overlaid with `path` if given, then with the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `DRIVESPLIT_*` variables found by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let var = format!("{ENV_PREFIX}{name}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some((_, value)) = get("DATABASE_URL") {
            self.database_url = value;
        }
        if let Some((_, value)) = get("STORAGE_ROOT") {
            self.storage_root = PathBuf::from(value);
        }
        if let Some((_, value)) = get("WORK_DIR") {
            self.work_dir = PathBuf::from(value);
        }
        if let Some((_, value)) = get("LISTEN_ADDR") {
            self.listen_addr = value;
        }
        if let Some((_, value)) = get("DEFAULT_STRATEGY") {
            self.default_strategy = value;
        }
        if let Some((var, value)) = get("MAX_PARALLEL_TRANSFERS") {
            self.max_parallel_transfers = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("ACCOUNT_OPS_PER_SECOND") {
            self.account_ops_per_second = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("PROCESSING_WORKERS") {
            self.processing_workers = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("MIN_CHUNK_SIZE") {
            self.chunk_policy.min_chunk_size = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("MAX_CHUNK_SIZE") {
            self.chunk_policy.max_chunk_size = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("SAFETY_MARGIN") {
            self.chunk_policy.safety_margin = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("RETRY_MAX_ELAPSED_MS") {
            self.retry.max_elapsed_ms = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("UPLOAD_IDLE_TIMEOUT_SECS") {
            self.upload_idle_timeout_secs = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("DOWNLOAD_STALL_TIMEOUT_SECS") {
            self.download_stall_timeout_secs = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("ARTIFACT_TTL_SECS") {
            self.artifact_ttl_secs = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("SESSION_RETENTION_SECS") {
            self.session_retention_secs = parse_var(&var, &value)?;
        }
        if let Some((var, value)) = get("REAPER_INTERVAL_SECS") {
            self.reaper_interval_secs = parse_var(&var, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.chunk_policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.default_strategy.trim().is_empty() {
            return Err(ConfigError::Invalid("default_strategy must not be empty".into()));
        }
        if self.max_parallel_transfers == 0 {
            return Err(ConfigError::Invalid("max_parallel_transfers must be positive".into()));
        }
        if self.processing_workers == 0 {
            return Err(ConfigError::Invalid("processing_workers must be positive".into()));
        }
        for (name, secs) in [
            ("upload_idle_timeout_secs", self.upload_idle_timeout_secs),
            ("download_stall_timeout_secs", self.download_stall_timeout_secs),
            ("artifact_ttl_secs", self.artifact_ttl_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        SocketAddr::from_str(&self.listen_addr).map_err(|_| {
            ConfigError::Invalid(format!("listen_addr {:?} is not a socket address", self.listen_addr))
        })?;
        Ok(())
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }

    pub fn download_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.download_stall_timeout_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
