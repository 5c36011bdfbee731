//! Runtime settings
//!
//! Compiled defaults, overridable from `RELABEL_*` environment variables:
//! - `RELABEL_BACKUP_DIR`: where backups and `ops.log` are written
//!   (default `~/.kube/relabel-backups`)
//! - `RELABEL_WAIT_TIMEOUT_SECS`: rollout convergence deadline (default 180)
//! - `RELABEL_POLL_INTERVAL_SECS`: rollout poll interval (default 20)
//!
//! Per-run CLI flags (`--timeout`, `--auto`) are applied on top by the CLI.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const BACKUP_DIR_ENV: &str = "RELABEL_BACKUP_DIR";
const WAIT_TIMEOUT_ENV: &str = "RELABEL_WAIT_TIMEOUT_SECS";
const POLL_INTERVAL_ENV: &str = "RELABEL_POLL_INTERVAL_SECS";

const DEFAULT_BACKUP_SUBDIR: &str = ".kube/relabel-backups";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got '{value}'")]
    InvalidSeconds { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    ZeroInterval { var: &'static str },

    #[error("could not determine home directory; set {BACKUP_DIR_ENV}")]
    NoHomeDir,
}

/// Timing and storage knobs threaded through every orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Deadline for a deployment to converge after create
    pub rollout_timeout: Duration,
    /// Interval between rollout status polls
    pub rollout_poll_interval: Duration,
    /// Deadline for pods of a copied deployment to become ready
    pub pods_timeout: Duration,
    pub pods_poll_interval: Duration,
    /// Bound on waiting for a deleted deployment to disappear before reusing its name
    pub deletion_timeout: Duration,
    pub deletion_poll_interval: Duration,
    /// Grace period for deleting the original and the shadow
    pub grace_period_secs: u32,
    /// Grace period for deleting copied deployments and services
    pub copy_grace_period_secs: u32,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// Pods restarting more often than this are reported by `get deployment`
    pub restart_threshold: i32,
    pub backup_dir: PathBuf,
}

impl Settings {
    /// Defaults with an explicit backup directory
    pub fn with_backup_dir(backup_dir: impl Into<PathBuf>) -> Self {
        Settings {
            rollout_timeout: Duration::from_secs(180),
            rollout_poll_interval: Duration::from_secs(20),
            pods_timeout: Duration::from_secs(100),
            pods_poll_interval: Duration::from_secs(3),
            deletion_timeout: Duration::from_secs(60),
            deletion_poll_interval: Duration::from_secs(2),
            grace_period_secs: 8,
            copy_grace_period_secs: 40,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            restart_threshold: 30,
            backup_dir: backup_dir.into(),
        }
    }

    /// Load settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load settings from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backup_dir = match lookup(BACKUP_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(DEFAULT_BACKUP_SUBDIR),
        };

        let mut settings = Settings::with_backup_dir(backup_dir);

        if let Some(secs) = seconds(&lookup, WAIT_TIMEOUT_ENV)? {
            settings.rollout_timeout = secs;
        }
        if let Some(secs) = seconds(&lookup, POLL_INTERVAL_ENV)? {
            if secs.is_zero() {
                return Err(ConfigError::ZeroInterval {
                    var: POLL_INTERVAL_ENV,
                });
            }
            settings.rollout_poll_interval = secs;
        }

        Ok(settings)
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidSeconds { var, value }),
    }
}
