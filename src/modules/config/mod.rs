//! Process-wide settings for the authentication core.
//!
//! Settings are read from a JSON file (defaults apply to anything missing),
//! then overridden from the environment, then validated once at startup.
//! Nothing here changes after the service is built.

use std::path::{Path, PathBuf};

use chrono::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::modules::auth::password::DerivationParams;

pub const ENV_SIGNING_SECRET: &str = "HOUSE_KEYS_SIGNING_SECRET";
pub const ENV_LOG_LEVEL: &str = "HOUSE_KEYS_LOG_LEVEL";
pub const ENV_USERS_FILE: &str = "HOUSE_KEYS_USERS_FILE";

/// Smallest salt Argon2 accepts
const MIN_SALT_LENGTH: usize = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HMAC secret; falls back to the OS keyring when absent
    #[serde(skip_serializing)]
    pub signing_secret: Option<String>,
    pub token_lifetime_minutes: i64,
    pub refresh_window_hours: i64,
    pub argon2: DerivationParams,
    pub salt_length: usize,
    pub max_concurrent_derivations: usize,
    pub store_timeout_secs: u64,
    pub users_file: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            token_lifetime_minutes: 15,
            refresh_window_hours: 7 * 24,
            argon2: DerivationParams::default(),
            salt_length: 32,
            max_concurrent_derivations: 4,
            store_timeout_secs: 5,
            users_file: PathBuf::from(crate::USERS_FILE),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl AuthConfig {
    /// Load `path` if it exists, apply environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)?;
                debug!("Loading configuration from {}", path.display());
                serde_json::from_str(&contents)?
            }
            _ => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables, looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SIGNING_SECRET) {
            self.signing_secret = Some(secret);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(file) = lookup(ENV_USERS_FILE) {
            self.users_file = PathBuf::from(file);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_lifetime_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "token_lifetime_minutes must be positive".to_string(),
            ));
        }
        if self.refresh_window_hours < 0 {
            return Err(ConfigError::Invalid(
                "refresh_window_hours cannot be negative".to_string(),
            ));
        }
        self.token_lifetime()?;
        self.refresh_window()?;
        if self.salt_length < MIN_SALT_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "salt_length must be at least {} bytes",
                MIN_SALT_LENGTH
            )));
        }
        if self.max_concurrent_derivations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_derivations must be at least 1".to_string(),
            ));
        }
        if self.store_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "store_timeout_secs must be positive".to_string(),
            ));
        }
        if matches!(&self.signing_secret, Some(secret) if secret.is_empty()) {
            return Err(ConfigError::Invalid("signing secret is empty".to_string()));
        }
        self.argon2
            .to_argon2()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn token_lifetime(&self) -> Result<Duration, ConfigError> {
        Duration::try_minutes(self.token_lifetime_minutes).ok_or_else(|| {
            ConfigError::Invalid("token_lifetime_minutes is out of range".to_string())
        })
    }

    pub fn refresh_window(&self) -> Result<Duration, ConfigError> {
        Duration::try_hours(self.refresh_window_hours).ok_or_else(|| {
            ConfigError::Invalid("refresh_window_hours is out of range".to_string())
        })
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.store_timeout_secs)
    }

    /// Configured secret as key bytes, if any
    pub fn signing_secret_bytes(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.signing_secret
            .as_ref()
            .map(|secret| Zeroizing::new(secret.as_bytes().to_vec()))
    }
}
