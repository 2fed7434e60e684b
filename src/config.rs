//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Shared database file every cooperating process opens.
    pub db_path: PathBuf,
    /// Maximum concurrently IN_PROGRESS tasks per order.
    pub max_workers: usize,
    /// Worker program followed by its arguments. Empty disables real launches.
    pub worker_command: Vec<String>,
    /// Hard wall-clock limit per worker subprocess.
    pub worker_timeout: Duration,
    /// How often a running worker's heartbeat is written.
    pub heartbeat_interval: Duration,
    /// IN_PROGRESS tasks idle longer than this are reported stuck.
    pub stuck_threshold: Duration,
    /// Directory for the daily-rolling orchestrator log. None logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Directory for per-task worker output logs.
    pub worker_log_dir: PathBuf,
    /// Rejections at which a task escalates to a model upgrade.
    pub reject_escalation_threshold: u32,
    /// Interval between cycles of the periodic launch loop.
    pub launch_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("conductor.db"),
            max_workers: 3,
            worker_command: Vec::new(),
            worker_timeout: Duration::from_secs(3600), // 1 hour
            heartbeat_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(30 * 60), // 30 minutes
            log_dir: None,
            worker_log_dir: PathBuf::from("logs/workers"),
            reject_escalation_threshold: crate::transitions::DEFAULT_REJECT_THRESHOLD,
            launch_interval: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from `CONDUCTOR_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("CONDUCTOR_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = get("CONDUCTOR_MAX_WORKERS") {
            config.max_workers = parse_number("CONDUCTOR_MAX_WORKERS", &raw)?;
        }
        if let Some(raw) = get("CONDUCTOR_WORKER_CMD") {
            config.worker_command = raw.split_whitespace().map(str::to_string).collect();
        }
        if let Some(raw) = get("CONDUCTOR_WORKER_TIMEOUT_SECS") {
            config.worker_timeout =
                Duration::from_secs(parse_number("CONDUCTOR_WORKER_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = get("CONDUCTOR_STUCK_MINUTES") {
            let minutes: u64 = parse_number("CONDUCTOR_STUCK_MINUTES", &raw)?;
            config.stuck_threshold = minutes_to_duration("CONDUCTOR_STUCK_MINUTES", minutes)?;
        }
        if let Some(dir) = get("CONDUCTOR_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = get("CONDUCTOR_WORKER_LOG_DIR") {
            config.worker_log_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("CONDUCTOR_REJECT_ESCALATION_THRESHOLD") {
            let threshold: u32 = parse_number("CONDUCTOR_REJECT_ESCALATION_THRESHOLD", &raw)?;
            if threshold == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "CONDUCTOR_REJECT_ESCALATION_THRESHOLD".into(),
                    message: "must be at least 1".into(),
                });
            }
            config.reject_escalation_threshold = threshold;
        }

        Ok(config)
    }
}

/// Whole minutes as a `Duration`. Values whose seconds overflow `u64` are
/// rejected under `key`.
pub fn minutes_to_duration(key: &str, minutes: u64) -> Result<Duration, ConfigError> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{minutes} minutes is out of range"),
        })
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
