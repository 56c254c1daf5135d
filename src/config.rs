//! Configuration loaded from `settle.toml`.
//!
//! [`SettleConfig`] holds every tunable of the timer and the demo binary.
//! Keys missing from the file use sensible defaults.
//! The `SETTLE_INTERVAL_MS` environment variable takes precedence over the file.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettleError;

/// Default file name looked up in the working directory.
pub const CONFIG_FILE: &str = "settle.toml";

/// Environment variable overriding `interval_ms`.
pub const INTERVAL_ENV: &str = "SETTLE_INTERVAL_MS";

/// What happens to finalization work registered after the finalizing window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateParticipationPolicy {
    /// Run the work detached from the epoch; the caller still gets an error.
    #[default]
    Detach,
    /// Drop the work.
    Reject,
}

impl fmt::Display for LateParticipationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LateParticipationPolicy::Detach => write!(f, "detach"),
            LateParticipationPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Top-level configuration loaded from `settle.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleConfig {
    /// Quiet interval in milliseconds before an epoch settles.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Handling of finalization work registered too late.
    #[serde(default)]
    pub late_participation: LateParticipationPolicy,

    /// `tracing-subscriber` filter directive used by the binary.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

// Default quiet interval: one second.
fn default_interval_ms() -> u64 {
    1000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            late_participation: LateParticipationPolicy::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl SettleConfig {
    /// Loads `settle.toml` from the working directory.
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> Result<Self, SettleError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Loads the configuration from `path`, then applies environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, SettleError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<SettleConfig>(&contents)?
        } else {
            Self::default()
        };

        // The environment wins over the file for the interval.
        if let Ok(raw) = std::env::var(INTERVAL_ENV)
            && !raw.trim().is_empty()
        {
            config.interval_ms = raw.trim().parse().map_err(|e| {
                SettleError::Config(format!(
                    "{INTERVAL_ENV} must be an integer number of milliseconds: {e}"
                ))
            })?;
        }

        Ok(config)
    }

    /// The configured interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = SettleConfig::default();
        assert_eq!(config.interval_ms, 1000);
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.late_participation, LateParticipationPolicy::Detach);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            interval_ms = 250
            late_participation = "reject"
        "#;
        let config: SettleConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.interval_ms, 250);
        assert_eq!(config.late_participation, LateParticipationPolicy::Reject);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let result = toml::from_str::<SettleConfig>(r#"late_participation = "ignore""#);
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_filter = \"settle=trace\"").unwrap();

        let config = SettleConfig::load_from(file.path()).unwrap();
        assert_eq!(config.log_filter, "settle=trace");
    }

    #[test]
    fn malformed_file_is_a_toml_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interval_ms = \"soon\"").unwrap();

        let err = SettleConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, SettleError::Toml(_)));
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SettleConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.late_participation, LateParticipationPolicy::Detach);
    }

    #[test]
    fn config_serializes_back_to_toml() {
        let rendered = toml::to_string(&SettleConfig::default()).unwrap();
        assert!(rendered.contains("interval_ms = 1000"));
        assert!(rendered.contains("late_participation = \"detach\""));
    }

    #[test]
    fn policy_display() {
        assert_eq!(LateParticipationPolicy::Detach.to_string(), "detach");
        assert_eq!(LateParticipationPolicy::Reject.to_string(), "reject");
    }
}
