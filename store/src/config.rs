//! Configuration management for the store.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of attempts before a queued command is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay before the first retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(600);
/// Default upper bound for the doubled retry delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Where the store keeps its files.
pub trait FileLocations: Send + Sync {
    /// Path of the SQLite database file.
    fn database_path(&self) -> &Path;

    /// Directory of the legacy one-file-per-command queue, if used.
    fn legacy_queue_dir(&self) -> Option<&Path>;
}

/// Store configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Use the legacy file-backed command queue in this directory
    pub legacy_queue_dir: Option<PathBuf>,
    /// Command queue settings
    pub queue: QueueConfig,
    /// Pause and resume the queue from connectivity changes
    pub monitor_reachability: bool,
}

/// Retry settings for the durable command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Attempts before a retryable failure becomes terminal
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after every further failure
    pub retry_delay: Duration,
    /// Cap for the doubled delay
    pub max_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_retry_delay)
    }
}

impl Config {
    /// Configuration for a database file with default queue settings.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            legacy_queue_dir: None,
            queue: QueueConfig::default(),
            monitor_reachability: true,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = env::var("MOORING_DATABASE_PATH")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingDatabasePath)?;

        let legacy_queue_dir = env::var("MOORING_LEGACY_QUEUE_DIR").ok().map(PathBuf::from);

        let max_attempts = match env::var("MOORING_MAX_ATTEMPTS") {
            Ok(raw) => raw
                .parse()
                .ok()
                .filter(|n: &u32| *n > 0)
                .ok_or(ConfigError::InvalidMaxAttempts)?,
            Err(_) => DEFAULT_MAX_ATTEMPTS,
        };

        let retry_delay = duration_ms("MOORING_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY)?;
        let max_retry_delay = duration_ms("MOORING_MAX_RETRY_DELAY_MS", DEFAULT_MAX_RETRY_DELAY)?
            .max(retry_delay);

        let monitor_reachability = match env::var("MOORING_MONITOR_REACHABILITY") {
            Ok(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidFlag("MOORING_MONITOR_REACHABILITY"))?,
            Err(_) => true,
        };

        Ok(Self {
            database_path,
            legacy_queue_dir,
            queue: QueueConfig {
                max_attempts,
                retry_delay,
                max_retry_delay,
            },
            monitor_reachability,
        })
    }
}

impl FileLocations for Config {
    fn database_path(&self) -> &Path {
        &self.database_path
    }

    fn legacy_queue_dir(&self) -> Option<&Path> {
        self.legacy_queue_dir.as_deref()
    }
}

fn duration_ms(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidDuration(var)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("MOORING_DATABASE_PATH environment variable is required")]
    MissingDatabasePath,

    #[error("Invalid MOORING_MAX_ATTEMPTS value")]
    InvalidMaxAttempts,

    #[error("Invalid {0} value, expected milliseconds")]
    InvalidDuration(&'static str),

    #[error("Invalid {0} value, expected a boolean")]
    InvalidFlag(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            max_attempts: 5,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(500),
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn defaults() {
        let config = Config::new("/tmp/x.sqlite");
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.retry_delay, Duration::from_secs(600));
        assert!(config.legacy_queue_dir().is_none());
        assert_eq!(config.database_path(), Path::new("/tmp/x.sqlite"));
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
