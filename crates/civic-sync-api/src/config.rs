use std::collections::{BTreeSet, HashMap};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderName;
use civic_sync_core::config::{optional_trimmed, ranged, value_or_default, ConfigError};
use civic_sync_core::SyncConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    /// Gateway-set header carrying the authenticated user id
    pub identity_header: HeaderName,
    pub worker_interval: Duration,
    pub worker_batch_size: usize,
    /// Entity types users may download; `None` allows all
    pub readable_types: Option<BTreeSet<String>>,
    /// Entity types users may write; `None` allows all
    pub writable_types: Option<BTreeSet<String>>,
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CIVIC_SYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "CIVIC_SYNC_DATABASE_PATH",
            "civic-sync.db",
        ));

        let header = value_or_default(&lookup, "CIVIC_SYNC_IDENTITY_HEADER", "x-civic-user-id");
        let identity_header = HeaderName::try_from(header.to_ascii_lowercase()).map_err(|_| {
            ConfigError::Invalid(format!(
                "CIVIC_SYNC_IDENTITY_HEADER `{header}` is not a valid header name"
            ))
        })?;

        let worker_interval_secs =
            ranged(&lookup, "CIVIC_SYNC_WORKER_INTERVAL_SECS", 5, 1..=3_600)?;
        let worker_batch_size = ranged(&lookup, "CIVIC_SYNC_WORKER_BATCH_SIZE", 100, 1..=10_000)?;

        let readable_types = type_list(&lookup, "CIVIC_SYNC_READABLE_TYPES");
        let writable_types = type_list(&lookup, "CIVIC_SYNC_WRITABLE_TYPES");

        let sync = SyncConfig::from_lookup(&lookup)?;

        Ok(Self {
            bind_addr,
            database_path,
            identity_header,
            worker_interval: Duration::from_secs(worker_interval_secs),
            worker_batch_size: usize::try_from(worker_batch_size).map_err(|_| {
                ConfigError::Invalid("CIVIC_SYNC_WORKER_BATCH_SIZE".to_string())
            })?,
            readable_types,
            writable_types,
            sync,
        })
    }
}

/// Comma-separated entity types; unset or empty means unrestricted
fn type_list(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<BTreeSet<String>> {
    let types: BTreeSet<String> = optional_trimmed(lookup, name)?
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    (!types.is_empty()).then_some(types)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_defaults_without_env() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.identity_header.as_str(), "x-civic-user-id");
        assert_eq!(config.worker_interval, Duration::from_secs(5));
        assert!(config.readable_types.is_none());
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn config_parses_allow_lists_and_header() {
        let config = config_from(&[
            ("CIVIC_SYNC_IDENTITY_HEADER", "X-Forwarded-User"),
            ("CIVIC_SYNC_WRITABLE_TYPES", "report, comment,,"),
            ("CIVIC_SYNC_READABLE_TYPES", " "),
        ])
        .unwrap();

        assert_eq!(config.identity_header.as_str(), "x-forwarded-user");
        assert_eq!(
            config.writable_types,
            Some(BTreeSet::from(["comment".to_string(), "report".to_string()]))
        );
        assert!(config.readable_types.is_none());
    }

    #[test]
    fn config_rejects_invalid_values() {
        let err = config_from(&[("CIVIC_SYNC_IDENTITY_HEADER", "bad header")]).unwrap_err();
        assert!(err.to_string().contains("CIVIC_SYNC_IDENTITY_HEADER"));

        let err = config_from(&[("CIVIC_SYNC_WORKER_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("CIVIC_SYNC_WORKER_INTERVAL_SECS"));

        let err = config_from(&[("SYNC_MAX_ATTEMPTS", "many")]).unwrap_err();
        assert!(err.to_string().contains("SYNC_MAX_ATTEMPTS"));
    }
}
