//! Scheduler configuration

use std::path::Path;
use std::time::Duration;

use spool_common::{DriverSettings, MAX_TIMER_MS};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default cap on a single engine timer wait (`i32::MAX` milliseconds)
pub const DEFAULT_MAX_TIMER_MS: u64 = MAX_TIMER_MS;

/// Smallest accepted timer cap
pub const MIN_MAX_TIMER_MS: u64 = 1;

// =============================================================================
// Scheduler Config
// =============================================================================

/// Scheduler configuration
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Longest single timer wait in milliseconds; longer engine requests are
    /// clamped
    #[serde(default = "default_max_timer_ms")]
    pub max_timer_ms: u64,

    /// Settings applied to the driver when it is opened
    #[serde(default)]
    pub driver: DriverSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_timer_ms: default_max_timer_ms(),
            driver: DriverSettings::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MAX_TIMER_MS..=DEFAULT_MAX_TIMER_MS).contains(&self.max_timer_ms) {
            return Err(Error::Config {
                message: format!(
                    "max_timer_ms must be between {MIN_MAX_TIMER_MS} and {DEFAULT_MAX_TIMER_MS}, got {}",
                    self.max_timer_ms
                ),
            });
        }
        if self.driver.max_host_connections == Some(0) || self.driver.max_total_connections == Some(0)
        {
            return Err(Error::Config {
                message: "connection limits must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Timer cap as a duration
    pub fn max_timer(&self) -> Duration {
        Duration::from_millis(self.max_timer_ms)
    }

    /// Clamp an engine-requested timer to the cap
    pub fn clamp_timer(&self, timeout: Duration) -> Duration {
        timeout.min(self.max_timer())
    }
}

fn default_max_timer_ms() -> u64 {
    DEFAULT_MAX_TIMER_MS
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_timer_ms, i32::MAX as u64);
        assert!(config.driver.multiplex);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = SchedulerConfig::from_json("{}").expect("parse");
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let config = SchedulerConfig::from_json(
            r#"{"max_timer_ms": 5000, "driver": {"max_host_connections": 6}}"#,
        )
        .expect("parse");
        assert_eq!(config.max_timer(), Duration::from_secs(5));
        assert_eq!(config.driver.max_host_connections, Some(6));
        assert_eq!(config.driver.max_total_connections, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SchedulerConfig::from_json(r#"{"max_timer_ms": 0}"#),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            SchedulerConfig::from_json(r#"{"driver": {"max_total_connections": 0}}"#),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            SchedulerConfig::from_json("not json"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_clamp_timer() {
        let config = SchedulerConfig {
            max_timer_ms: 100,
            ..Default::default()
        };
        assert_eq!(
            config.clamp_timer(Duration::from_secs(60)),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.clamp_timer(Duration::from_millis(5)),
            Duration::from_millis(5)
        );

        let default = SchedulerConfig::default();
        let huge = Duration::from_secs(u64::MAX / 2);
        assert_eq!(default.clamp_timer(huge), default.max_timer());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"driver": {{"multiplex": false}}}}"#).expect("write");

        let config = SchedulerConfig::load(file.path()).expect("load");
        assert!(!config.driver.multiplex);
    }

    #[test]
    fn test_load_missing_file() {
        let result = SchedulerConfig::load(Path::new("/nonexistent/spool.json"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = SchedulerConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let deserialized = SchedulerConfig::from_json(&json).expect("deserialize");
        assert_eq!(config, deserialized);
    }
}
