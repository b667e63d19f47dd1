//! Sync engine tuning.
//!
//! Every knob has a default; deployments override them through `SYNC_*`
//! environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::models::DEFAULT_MAX_ATTEMPTS;
use crate::sync::StrategyPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Actions applied synchronously per upload; the rest wait for the worker
    pub upload_batch_size: usize,
    pub download_page_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub session_timeout: Duration,
    pub strategies: StrategyPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 200,
            download_page_size: 100,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            session_timeout: Duration::from_secs(30),
            strategies: StrategyPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let upload_batch_size = ranged(&lookup, "SYNC_UPLOAD_BATCH_SIZE", 200, 1..=5_000)?;
        let download_page_size = ranged(&lookup, "SYNC_DOWNLOAD_PAGE_SIZE", 100, 1..=1_000)?;
        let max_attempts = ranged(&lookup, "SYNC_MAX_ATTEMPTS", 3, 1..=20)?;
        let backoff_base_secs = ranged(&lookup, "SYNC_BACKOFF_BASE_SECS", 1, 1..=60)?;
        let backoff_cap_secs = ranged(&lookup, "SYNC_BACKOFF_CAP_SECS", 60, 1..=3_600)?;
        if backoff_cap_secs < backoff_base_secs {
            return Err(ConfigError::Invalid(
                "SYNC_BACKOFF_CAP_SECS must be >= SYNC_BACKOFF_BASE_SECS".to_string(),
            ));
        }
        let session_timeout_secs = ranged(&lookup, "SYNC_SESSION_TIMEOUT_SECS", 30, 1..=600)?;

        let strategies = match optional_trimmed(&lookup, "SYNC_STRATEGIES") {
            Some(raw) => StrategyPolicy::parse(&raw)
                .map_err(|e| ConfigError::Invalid(format!("SYNC_STRATEGIES: {e}")))?,
            None => StrategyPolicy::default(),
        };

        Ok(Self {
            upload_batch_size: usize::try_from(upload_batch_size)
                .map_err(|_| ConfigError::Invalid("SYNC_UPLOAD_BATCH_SIZE".to_string()))?,
            download_page_size: usize::try_from(download_page_size)
                .map_err(|_| ConfigError::Invalid("SYNC_DOWNLOAD_PAGE_SIZE".to_string()))?,
            max_attempts: u32::try_from(max_attempts)
                .map_err(|_| ConfigError::Invalid("SYNC_MAX_ATTEMPTS".to_string()))?,
            backoff_base: Duration::from_secs(backoff_base_secs),
            backoff_cap: Duration::from_secs(backoff_cap_secs),
            session_timeout: Duration::from_secs(session_timeout_secs),
            strategies,
        })
    }

    /// Delay before the next attempt after `attempt_count` failures:
    /// `base * 2^attempt_count`, capped
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_count);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

/// Integer variable with a default, rejected outside `range`
pub fn ranged(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let bounds = format!("[{}, {}]", range.start(), range.end());
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("{name} must be an integer in {bounds}"))
        })?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!("{name} must be in {bounds}")));
    }
    Ok(value)
}

pub fn value_or_default(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolutionStrategy;
    use pretty_assertions::assert_eq;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(config_from(&[]).unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_overrides_and_strategies() {
        let config = config_from(&[
            ("SYNC_UPLOAD_BATCH_SIZE", "50"),
            ("SYNC_MAX_ATTEMPTS", " 5 "),
            ("SYNC_STRATEGIES", "report=server_wins,comment=merge"),
        ])
        .unwrap();

        assert_eq!(config.upload_batch_size, 50);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(
            config.strategies.strategy_for("comment"),
            ResolutionStrategy::Merge
        );
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = config_from(&[("SYNC_DOWNLOAD_PAGE_SIZE", "0")]).unwrap_err();
        assert!(err.to_string().contains("SYNC_DOWNLOAD_PAGE_SIZE"));

        let err = config_from(&[("SYNC_SESSION_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("integer"));

        let err = config_from(&[("SYNC_STRATEGIES", "report=newest")]).unwrap_err();
        assert!(err.to_string().contains("SYNC_STRATEGIES"));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(6), Duration::from_secs(60));
        assert_eq!(config.backoff(40), Duration::from_secs(60));
    }
}
