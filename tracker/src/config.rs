//! Configuration module for the CodeTrackr tracker.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CODETRACKR_API_BASE` | No | hosted collector | Collector base URL |
//! | `CODETRACKR_USER_ID` | No | `$USER`, else hostname | User identifier (logged only) |
//! | `CODETRACKR_API_KEY` | No | stored key | API key, overrides the key file |
//! | `CODETRACKR_KEY_PATH` | No | `~/.codetrackr` | Directory containing `api_key` |
//! | `CODETRACKR_FLUSH_INTERVAL_SECS` | No | 30 | Seconds between flush checks |
//! | `CODETRACKR_MIN_FLUSH_MINUTES` | No | 0.1 | Minimum minutes for a scheduled flush |
//! | `CODETRACKR_IDLE_THRESHOLD_SECS` | No | 120 | Inactivity before tracking pauses |
//! | `CODETRACKR_LINE_CACHE_SIZE` | No | 1000 | Files whose line counts are remembered |
//! | `CODETRACKR_PROJECT_NAME` | No | workspace name | Project name reported to the collector |
//!
//! `CODETRACKR_API_KEY` is read by [`crate::credentials::CredentialStore`]
//! so that every command resolves the key the same way.
//!
//! # Example
//!
//! ```no_run
//! use codetrackr::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Collector: {}", config.api_base);
//! ```

use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::credentials::{ApiKey, CredentialVerifier};
use crate::delivery::DeliveryConfig;
use crate::line_tracker::DEFAULT_LINE_CACHE_SIZE;
use crate::scheduler::TrackerSettings;
use crate::session::{SessionConfig, DEFAULT_MIN_FLUSH_MINUTES};
use crate::types::UserIdentity;

/// Hosted collector used when no base URL is configured.
pub const DEFAULT_API_BASE: &str = "https://codetrackr-backend-uckp.onrender.com";

/// Default key directory name relative to home.
const DEFAULT_KEY_DIR: &str = ".codetrackr";

/// Default seconds between flush checks.
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Default idle threshold in seconds.
const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 120;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Tracker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Collector base URL, without trailing slash.
    pub api_base: String,

    /// User identifier.
    pub user_id: String,

    /// Directory containing the stored API key.
    pub key_path: PathBuf,

    /// Seconds between flush checks.
    pub flush_interval_secs: u64,

    /// Minimum buffered minutes before a scheduled flush.
    pub min_flush_minutes: f64,

    /// Seconds without activity before tracking pauses.
    pub idle_threshold_secs: u64,

    /// Capacity of the per-file line count cache.
    pub line_cache_size: NonZeroUsize,

    /// Project name override.
    pub project_name: Option<String>,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - A numeric variable is set but cannot be parsed or is out of range
    /// - The home directory cannot be determined (needed for the default key path)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Optional: CODETRACKR_API_BASE
        let api_base = env::var("CODETRACKR_API_BASE")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        // Optional: CODETRACKR_USER_ID (default: login name, else hostname)
        let user_id = env::var("CODETRACKR_USER_ID")
            .or_else(|_| env::var("USER"))
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_else(|_| get_hostname());

        // Optional: CODETRACKR_KEY_PATH (default: ~/.codetrackr)
        let key_path = match env::var("CODETRACKR_KEY_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs.home_dir().join(DEFAULT_KEY_DIR)
            }
        };

        let flush_interval_secs = parse_var(
            "CODETRACKR_FLUSH_INTERVAL_SECS",
            DEFAULT_FLUSH_INTERVAL_SECS,
            "positive integer",
        )?;
        if flush_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CODETRACKR_FLUSH_INTERVAL_SECS".to_string(),
                message: "flush interval must be at least 1 second".to_string(),
            });
        }

        let min_flush_minutes = parse_var(
            "CODETRACKR_MIN_FLUSH_MINUTES",
            DEFAULT_MIN_FLUSH_MINUTES,
            "non-negative number",
        )?;
        if !min_flush_minutes.is_finite() || min_flush_minutes < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "CODETRACKR_MIN_FLUSH_MINUTES".to_string(),
                message: format!("must be a finite number >= 0, got {min_flush_minutes}"),
            });
        }

        let idle_threshold_secs = parse_var(
            "CODETRACKR_IDLE_THRESHOLD_SECS",
            DEFAULT_IDLE_THRESHOLD_SECS,
            "positive integer",
        )?;
        if idle_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CODETRACKR_IDLE_THRESHOLD_SECS".to_string(),
                message: "idle threshold must be at least 1 second".to_string(),
            });
        }

        let line_cache_size = parse_var(
            "CODETRACKR_LINE_CACHE_SIZE",
            DEFAULT_LINE_CACHE_SIZE,
            "positive integer",
        )?;
        let line_cache_size =
            NonZeroUsize::new(line_cache_size).ok_or_else(|| ConfigError::InvalidValue {
                key: "CODETRACKR_LINE_CACHE_SIZE".to_string(),
                message: "cache size must be greater than 0".to_string(),
            })?;

        // Optional: CODETRACKR_PROJECT_NAME (default: derived from the workspace)
        let project_name = env::var("CODETRACKR_PROJECT_NAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(Self {
            api_base,
            user_id,
            key_path,
            flush_interval_secs,
            min_flush_minutes,
            idle_threshold_secs,
            line_cache_size,
            project_name,
        })
    }

    /// Settings for the tracker task.
    #[must_use]
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            session: SessionConfig {
                idle_threshold: Duration::from_secs(self.idle_threshold_secs),
                min_flush_minutes: self.min_flush_minutes,
            },
            line_cache_size: self.line_cache_size,
        }
    }

    /// Settings for the delivery client.
    #[must_use]
    pub fn delivery_config(&self, api_key: Option<ApiKey>) -> DeliveryConfig {
        DeliveryConfig::new(self.api_base.clone(), api_key, self.project_name.clone())
    }

    /// Checks `key` once against the configured collector.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CodeTrackrError::Http`] if the client cannot be
    /// built and [`crate::CodeTrackrError::Verify`] if the collector rejects
    /// the key or cannot be reached.
    pub async fn verify_key(&self, key: &ApiKey) -> crate::Result<UserIdentity> {
        let verifier = CredentialVerifier::new(self.api_base.clone())?;
        Ok(verifier.verify(key).await?)
    }
}

/// Parses an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T, expected: &str) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected {expected}, got '{val}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all CODETRACKR_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("CODETRACKR_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("CODETRACKR_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            let config = Config::from_env().expect("should parse empty config");

            assert_eq!(config.api_base, DEFAULT_API_BASE);
            assert_eq!(config.flush_interval_secs, 30);
            assert_eq!(config.min_flush_minutes, 0.1);
            assert_eq!(config.idle_threshold_secs, 120);
            assert_eq!(config.line_cache_size.get(), 1000);
            assert!(config.project_name.is_none());
            assert!(!config.user_id.is_empty());
            assert!(config.key_path.ends_with(DEFAULT_KEY_DIR));
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_API_BASE", "http://localhost:4000/");
            env::set_var("CODETRACKR_USER_ID", "ada");
            env::set_var("CODETRACKR_KEY_PATH", "/custom/keys");
            env::set_var("CODETRACKR_FLUSH_INTERVAL_SECS", "10");
            env::set_var("CODETRACKR_MIN_FLUSH_MINUTES", "0.5");
            env::set_var("CODETRACKR_IDLE_THRESHOLD_SECS", "300");
            env::set_var("CODETRACKR_LINE_CACHE_SIZE", "50");
            env::set_var("CODETRACKR_PROJECT_NAME", " webapp ");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.api_base, "http://localhost:4000");
            assert_eq!(config.user_id, "ada");
            assert_eq!(config.key_path, PathBuf::from("/custom/keys"));
            assert_eq!(config.flush_interval_secs, 10);
            assert_eq!(config.min_flush_minutes, 0.5);
            assert_eq!(config.idle_threshold_secs, 300);
            assert_eq!(config.line_cache_size.get(), 50);
            assert_eq!(config.project_name.as_deref(), Some("webapp"));
        });
    }

    #[test]
    #[serial]
    fn test_tracker_settings_follow_config() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_FLUSH_INTERVAL_SECS", "5");
            env::set_var("CODETRACKR_IDLE_THRESHOLD_SECS", "60");

            let settings = Config::from_env().unwrap().tracker_settings();
            assert_eq!(settings.flush_interval, Duration::from_secs(5));
            assert_eq!(settings.session.idle_threshold, Duration::from_secs(60));
            assert_eq!(settings.session.min_flush_minutes, 0.1);
        });
    }

    #[test]
    #[serial]
    fn test_invalid_flush_interval() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_FLUSH_INTERVAL_SECS", "soon");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "CODETRACKR_FLUSH_INTERVAL_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_flush_interval_rejected() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_FLUSH_INTERVAL_SECS", "0");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_negative_min_flush_rejected() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_MIN_FLUSH_MINUTES", "-1");
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("CODETRACKR_MIN_FLUSH_MINUTES"));
        });
    }

    #[test]
    #[serial]
    fn test_non_finite_min_flush_rejected() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_MIN_FLUSH_MINUTES", "NaN");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_zero_cache_size_rejected() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_LINE_CACHE_SIZE", "0");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "CODETRACKR_LINE_CACHE_SIZE"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_blank_project_name_ignored() {
        with_clean_env(|| {
            env::set_var("CODETRACKR_PROJECT_NAME", "   ");
            assert!(Config::from_env().unwrap().project_name.is_none());
        });
    }

    #[test]
    fn test_get_hostname() {
        assert!(!get_hostname().is_empty());
    }
}
