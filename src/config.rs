//! Engine configuration
//!
//! Loaded from TOML. Cache timeouts are given in minutes; a timeout of zero or
//! less disables caching for that component.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of a cached trigger chunk
    pub trigger_cache_timeout_minutes: i64,
    /// Lifetime of a cached "world has structures" flag
    pub world_flag_timeout_minutes: i64,
    /// Time box for delivering "created" notifications
    pub created_notification_timeout_secs: u64,
    /// Worker threads serving store I/O and queries
    pub storage_threads: usize,
    /// Worker threads firing events
    pub event_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trigger_cache_timeout_minutes: 120,
            world_flag_timeout_minutes: 120,
            created_notification_timeout_secs: 10,
            storage_threads: num_cpus::get().max(4),
            event_threads: 1,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        log::debug!("Loaded engine config from {}", path.display());
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.storage_threads == 0 {
            return Err(EngineError::Config {
                message: "storage_threads must be at least 1".to_string(),
            });
        }
        if self.event_threads == 0 {
            return Err(EngineError::Config {
                message: "event_threads must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn trigger_cache_policy(&self) -> CachePolicy {
        CachePolicy::from_minutes(self.trigger_cache_timeout_minutes)
    }

    pub fn world_flag_policy(&self) -> CachePolicy {
        CachePolicy::from_minutes(self.world_flag_timeout_minutes)
    }

    pub fn created_notification_timeout(&self) -> Duration {
        Duration::from_secs(self.created_notification_timeout_secs)
    }
}

/// Expiry and sweep settings for one `ExpiringCache`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// `None` disables caching
    pub timeout: Option<Duration>,
    pub sweep_interval: Duration,
    /// Reset an entry's timestamp on every successful read
    pub refresh_on_access: bool,
}

impl CachePolicy {
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            sweep_interval,
            refresh_on_access: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            timeout: None,
            sweep_interval: Duration::from_secs(60),
            refresh_on_access: false,
        }
    }

    /// Sweep runs every `max(1, minutes / 2)` minutes
    pub fn from_minutes(minutes: i64) -> Self {
        if minutes <= 0 {
            return Self::disabled();
        }
        let sweep_minutes = (minutes / 2).max(1) as u64;
        Self::new(
            Duration::from_secs(minutes as u64 * 60),
            Duration::from_secs(sweep_minutes * 60),
        )
    }

    pub fn with_refresh(mut self, refresh_on_access: bool) -> Self {
        self.refresh_on_access = refresh_on_access;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cache_policy_from_minutes() {
        let policy = CachePolicy::from_minutes(10);
        assert_eq!(policy.timeout, Some(Duration::from_secs(600)));
        assert_eq!(policy.sweep_interval, Duration::from_secs(300));
        assert!(policy.refresh_on_access);

        // Sweep interval never drops below one minute
        let short = CachePolicy::from_minutes(1);
        assert_eq!(short.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_non_positive_timeout_disables_cache() {
        assert!(!CachePolicy::from_minutes(0).is_enabled());
        assert!(!CachePolicy::from_minutes(-5).is_enabled());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("trigger_cache_timeout_minutes = 15\n")
            .expect("Failed to parse partial config");
        assert_eq!(config.trigger_cache_timeout_minutes, 15);
        assert_eq!(config.world_flag_timeout_minutes, 120);
        assert_eq!(config.created_notification_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = EngineConfig::from_toml_str("storage_threads = 0\n");
        assert!(matches!(result, Err(EngineError::Config { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp config file");
        writeln!(file, "world_flag_timeout_minutes = -1").expect("Failed to write config");
        writeln!(file, "event_threads = 2").expect("Failed to write config");

        let config = EngineConfig::load(file.path()).expect("Failed to load config file");
        assert!(!config.world_flag_policy().is_enabled());
        assert_eq!(config.event_threads, 2);
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let result = EngineConfig::from_toml_str("trigger_cache_timeout_minutes = \"soon\"");
        assert!(matches!(result, Err(EngineError::Config { .. })));
    }
}
