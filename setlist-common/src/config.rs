//! Configuration loading and config file resolution
//!
//! Config file resolution priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`SETLIST_CONFIG`)
//! 3. Per-user config file (`~/.config/setlist/config.toml` on Linux)
//! 4. Compiled defaults (fallback)
//!
//! A missing file is not fatal: a warning is logged and compiled defaults
//! are used. A file that exists but does not parse or validate is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "SETLIST_CONFIG";

/// Complete configuration for a composition client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    pub sync: SyncConfig,
    pub availability: AvailabilityConfig,
}

/// Submission, heartbeat and resync tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A submission without response after this long counts as failed
    pub submit_timeout_ms: u64,
    /// Pending mutations younger than this are reissued after a resync
    pub retry_budget_ms: u64,
    /// Interval between heartbeats
    pub heartbeat_interval_ms: u64,
    /// Consecutive failed heartbeats before the connection is declared lost
    pub heartbeat_miss_limit: u32,
    /// Consecutive failed resync attempts before a persistent notice appears
    pub resync_banner_after: u32,
    /// Ceiling for the doubling delay between failed resync attempts
    pub resync_backoff_max_ms: u64,
    /// Capacity of the store's event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 5_000,
            retry_budget_ms: 30_000,
            heartbeat_interval_ms: 2_000,
            heartbeat_miss_limit: 2,
            resync_banner_after: 3,
            resync_backoff_max_ms: 30_000,
            event_channel_capacity: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn resync_backoff_max(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_max_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.submit_timeout_ms == 0 {
            return Err(Error::Config("sync.submit_timeout_ms must be > 0".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "sync.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(Error::Config(
                "sync.heartbeat_miss_limit must be > 0".to_string(),
            ));
        }
        if self.resync_banner_after == 0 {
            return Err(Error::Config(
                "sync.resync_banner_after must be > 0".to_string(),
            ));
        }
        if self.resync_backoff_max_ms < self.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "sync.resync_backoff_max_ms ({}) must be >= heartbeat_interval_ms ({})",
                self.resync_backoff_max_ms, self.heartbeat_interval_ms
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config(
                "sync.event_channel_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Repetition policy for the availability calculator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// A song used within this many days is "recent"
    pub window_days: u32,
    /// Uses within the lookback at or above this count are "caution"; 0 disables
    pub frequency_threshold: u32,
    /// Rolling lookback for the frequency count
    pub lookback_days: u32,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            frequency_threshold: 3,
            lookback_days: 90,
        }
    }
}

impl ComposerConfig {
    /// Parse from TOML text and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ComposerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file path
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Resolve the config file and load it, falling back to defaults
    ///
    /// An explicit CLI path that does not exist is an error; the env var and
    /// per-user locations are optional.
    pub fn load(cli_arg: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_arg {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
        }

        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::load_file(&path)
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        let avail = &self.availability;
        if avail.lookback_days < avail.window_days {
            return Err(Error::Config(format!(
                "availability.lookback_days ({}) must be >= window_days ({})",
                avail.lookback_days, avail.window_days
            )));
        }
        Ok(())
    }
}

/// Config file path following the resolution priority order
///
/// Returns `None` when neither the CLI nor the environment names a file and
/// no per-user config file exists.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config file
    default_config_path().filter(|p| p.exists())
}

/// Per-user config file location for the platform
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("setlist").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ComposerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = ComposerConfig::from_toml_str(
            r#"
            [sync]
            submit_timeout_ms = 250

            [availability]
            window_days = 21
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.submit_timeout(), Duration::from_millis(250));
        assert_eq!(config.sync.retry_budget_ms, 30_000);
        assert_eq!(config.availability.window_days, 21);
        assert_eq!(config.availability.lookback_days, 90);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ComposerConfig::from_toml_str("[sync]\nheartbeat_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ComposerConfig::from_toml_str("[sync]\nresync_banner_after = 0\n").unwrap_err();
        assert!(err.to_string().contains("resync_banner_after"));

        let err = ComposerConfig::from_toml_str(
            "[sync]\nheartbeat_interval_ms = 500\nresync_backoff_max_ms = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("resync_backoff_max_ms"));

        let err = ComposerConfig::from_toml_str(
            "[availability]\nwindow_days = 60\nlookback_days = 30\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("lookback_days"));
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let err = ComposerConfig::from_toml_str("[sync\nsubmit_timeout_ms = 1").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_cli_arg_wins() {
        let path = Path::new("/tmp/setlist-explicit.toml");
        assert_eq!(
            resolve_config_path(Some(path), "SETLIST_TEST_UNSET_VAR"),
            Some(path.to_path_buf())
        );
    }
}
