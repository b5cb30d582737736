//! Engine configuration.
//!
//! Loaded from an optional JSON file, then overridden by `UOB_*` environment
//! variables. Every field has a default so an empty file is valid.

use std::path::Path;

use bacon_core::MAX_DEGREES;
use serde::{Deserialize, Serialize};

use crate::fraud::FraudConfig;
use crate::types::{MS_PER_DAY, MS_PER_HOUR};

mod defaults {
    pub fn base_url() -> String {
        "https://universityofbacon.com".to_string()
    }
    pub fn max_degrees() -> u8 {
        bacon_core::MAX_DEGREES
    }
    pub fn lock_duration_hours() -> u32 {
        bacon_core::fingerprint::LOCK_DURATION_HOURS
    }
    pub fn chain_inactivity_days() -> u32 {
        30
    }
    pub fn append_retries() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Origin used when rendering share URLs.
    #[serde(default = "defaults::base_url")]
    pub base_url: String,
    #[serde(default = "defaults::max_degrees")]
    pub max_degrees: u8,
    #[serde(default = "defaults::lock_duration_hours")]
    pub lock_duration_hours: u32,
    /// A non-terminal chain with no new link for this long reads as expired.
    #[serde(default = "defaults::chain_inactivity_days")]
    pub chain_inactivity_days: u32,
    /// Retries of a conflicting degree append before surfacing an error.
    #[serde(default = "defaults::append_retries")]
    pub append_retries: u32,
    #[serde(default)]
    pub fraud: FraudConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            max_degrees: defaults::max_degrees(),
            lock_duration_hours: defaults::lock_duration_hours(),
            chain_inactivity_days: defaults::chain_inactivity_days(),
            append_retries: defaults::append_retries(),
            fraud: FraudConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                serde_json::from_slice(&bytes).map_err(|e| ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            None => EngineConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `UOB_*` overrides from the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("UOB_BASE_URL") {
            self.base_url = url;
        }
        if let Some(raw) = lookup("UOB_LOCK_DURATION_HOURS") {
            self.lock_duration_hours = parse_env("UOB_LOCK_DURATION_HOURS", &raw)?;
        }
        if let Some(raw) = lookup("UOB_CHAIN_INACTIVITY_DAYS") {
            self.chain_inactivity_days = parse_env("UOB_CHAIN_INACTIVITY_DAYS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_degrees == 0 || self.max_degrees > MAX_DEGREES {
            return Err(ConfigError::InvalidValue {
                key: "max_degrees".into(),
                reason: format!("must be within 1..={MAX_DEGREES}"),
            });
        }
        if self.lock_duration_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "lock_duration_hours".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.chain_inactivity_days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chain_inactivity_days".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if let Err(err) = bacon_core::codes::validate_base_url(&self.base_url) {
            return Err(ConfigError::InvalidValue {
                key: "base_url".into(),
                reason: format!("{err}; expected an http(s) origin without a path"),
            });
        }
        self.fraud.validate()
    }

    pub fn lock_duration_ms(&self) -> u64 {
        self.lock_duration_hours as u64 * MS_PER_HOUR
    }

    pub fn chain_inactivity_ms(&self) -> u64 {
        self.chain_inactivity_days as u64 * MS_PER_DAY
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
