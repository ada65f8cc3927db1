//! Process configuration.
//!
//! Loaded from an optional YAML file and overridden by environment
//! variables, matching the external-interface contract: HTTP routing,
//! auth-key provisioning and the rest of the surrounding service are out
//! of scope, but they still need somewhere to read their settings from.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

const ENV_PORT: &str = "LOGLOOM_PORT";
const ENV_STORAGE_PATH: &str = "LOGLOOM_STORAGE_PATH";
const ENV_API_KEY: &str = "LOGLOOM_API_KEY";

/// What to do with an entry whose `ts` field fails to parse as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    /// Fail validation for that single entry.
    Reject,
    /// Substitute the current wall-clock time (source-compatible default).
    Now,
    /// Try a couple of common alternate layouts before falling back to `now`.
    BestEffort,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        TimestampPolicy::Now
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub storage_path: String,
    pub api_key: Option<String>,
    pub buffer_size: usize,
    pub flush_interval_secs: u64,
    pub chunk_size_bytes: usize,
    pub retention_days: u64,
    pub retention_sweep_interval_secs: u64,
    pub timestamp_policy: TimestampPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3100".to_string(),
            storage_path: "./data".to_string(),
            api_key: None,
            buffer_size: 1000,
            flush_interval_secs: 10,
            chunk_size_bytes: 1024 * 1024,
            retention_days: 7,
            retention_sweep_interval_secs: 3600,
            timestamp_policy: TimestampPolicy::Now,
        }
    }
}

impl Config {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }

    pub fn retention_horizon(&self) -> Duration {
        Duration::from_secs(self.retention_days * 86400)
    }

    /// Load configuration from `path` if given, otherwise start from
    /// built-in defaults, then apply environment variable overrides.
    ///
    /// A config file explicitly requested by the caller that cannot be
    /// read or parsed is `Fatal` (the process exits non-zero); an absent
    /// default-location file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|err| {
                    AppError::Fatal(format!("unable to read config {:?}: {}", path, err))
                })?;
                serde_yaml::from_str(&contents).map_err(|err| {
                    AppError::Fatal(format!("invalid config {:?}: {}", path, err))
                })?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var(ENV_PORT) {
            if let Some(host) = self.http_addr.rsplit_once(':').map(|(h, _)| h) {
                self.http_addr = format!("{}:{}", host, port);
            } else {
                self.http_addr = format!("0.0.0.0:{}", port);
            }
        }
        if let Ok(path) = std::env::var(ENV_STORAGE_PATH) {
            self.storage_path = path;
        }
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            self.api_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.retention_horizon(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn missing_optional_file_is_not_fatal() {
        let config = Config::load(None).expect("defaults should always load");
        assert_eq!(config.http_addr, "0.0.0.0:3100");
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var(ENV_PORT, "9999");
        std::env::set_var(ENV_API_KEY, "secret");
        let config = Config::load(None).expect("defaults should always load");
        assert!(config.http_addr.ends_with(":9999"));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        std::env::remove_var(ENV_PORT);
        std::env::remove_var(ENV_API_KEY);
    }
}
