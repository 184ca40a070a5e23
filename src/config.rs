//! Configuration stored in ~/.p3metrics/config.json.
//!
//! Every field has a default, so a missing file (at the default location)
//! yields a working local setup: SQLite mirror at `~/.p3metrics/records.db`,
//! UTC reporting, 30 second request budget.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::pipeline::attribution::AttributionPolicy;
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, RestStore, SqliteStore, DEFAULT_BATCH_SIZE};

/// Environment variable overriding `store.apiKey`.
pub const API_KEY_ENV: &str = "P3METRICS_API_KEY";

/// Which record store backend to read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Rest {
        url: String,
        #[serde(default, rename = "apiKey", alias = "api_key", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite { path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    /// IANA timezone used for year/month window boundaries.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(flatten)]
    pub attribution: AttributionPolicy,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            timezone: default_timezone(),
            request_timeout_secs: default_request_timeout_secs(),
            batch_size: default_batch_size(),
            retry: RetryPolicy::default(),
            attribution: AttributionPolicy::default(),
        }
    }
}

impl Config {
    /// Default config location: `~/.p3metrics/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".p3metrics").join("config.json"))
    }

    /// Load config. An explicit path must exist; the default path may be
    /// absent, in which case defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Config, MetricsError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(MetricsError::Configuration(format!(
                        "Config file not found at {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    log::debug!("No config file found, using defaults");
                    return Ok(Config::default());
                }
            },
        };

        let content = fs::read_to_string(&path).map_err(|e| {
            MetricsError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config, MetricsError> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| MetricsError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), MetricsError> {
        self.tz()?;
        if self.batch_size == 0 {
            return Err(MetricsError::Configuration(
                "batchSize must be at least 1".to_string(),
            ));
        }
        if self.attribution.eligible_deal_types.is_empty() {
            return Err(MetricsError::Configuration(
                "eligibleDealTypes must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Reporting timezone.
    pub fn tz(&self) -> Result<chrono_tz::Tz, MetricsError> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            MetricsError::Configuration(format!("Unknown timezone '{}'", self.timezone))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Open the local SQLite mirror. Fails for a REST store.
    pub fn open_mirror(&self) -> Result<SqliteStore, MetricsError> {
        match &self.store {
            StoreConfig::Sqlite { path: Some(path) } => Ok(SqliteStore::open_at(path.clone())?),
            StoreConfig::Sqlite { path: None } => Ok(SqliteStore::open()?),
            StoreConfig::Rest { .. } => Err(MetricsError::Configuration(
                "import needs a sqlite store; the configured store is rest".to_string(),
            )),
        }
    }

    /// Open the configured backend. `P3METRICS_API_KEY` overrides the
    /// configured REST key.
    pub fn open_store(&self) -> Result<Box<dyn RecordStore>, MetricsError> {
        match &self.store {
            StoreConfig::Sqlite { .. } => Ok(Box::new(self.open_mirror()?)),
            StoreConfig::Rest { url, api_key } => {
                let key = std::env::var(API_KEY_ENV)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
                    .or_else(|| api_key.clone())
                    .ok_or_else(|| {
                        MetricsError::Configuration(format!(
                            "REST store needs an API key (store.apiKey or {API_KEY_ENV})"
                        ))
                    })?;
                Ok(Box::new(RestStore::new(url, &key)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.store, StoreConfig::Sqlite { path: None });
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.attribution.overdue_after_days, 150);
        assert!(!config.attribution.contact_fallback);
    }

    #[test]
    fn test_rest_store_and_overrides() {
        let config = Config::parse(
            r#"{
                "store": {"kind": "rest", "url": "https://crm.example.com", "apiKey": "k"},
                "timezone": "America/New_York",
                "requestTimeoutSecs": 10,
                "retry": {"maxRetries": 5},
                "contactFallback": true,
                "eligibleDealTypes": ["Monthly Service"]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Rest {
                url: "https://crm.example.com".to_string(),
                api_key: Some("k".to_string())
            }
        );
        assert_eq!(config.tz().unwrap(), chrono_tz::America::New_York);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert!(config.attribution.contact_fallback);
        assert_eq!(config.attribution.eligible_deal_types.len(), 1);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let err = Config::parse(r#"{"timezone": "Mars/Olympus"}"#).unwrap_err();
        assert!(matches!(err, MetricsError::Configuration(_)));
    }

    #[test]
    fn test_empty_whitelist_rejected() {
        assert!(Config::parse(r#"{"eligibleDealTypes": []}"#).is_err());
    }

    #[test]
    fn test_open_mirror_rejects_rest_store() {
        let config = Config::parse(r#"{"store": {"kind": "rest", "url": "https://x.example.com"}}"#).unwrap();
        assert!(matches!(
            config.open_mirror(),
            Err(MetricsError::Configuration(_))
        ));
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_from_file_opens_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("mirror.db");
        let cfg_path = dir.path().join("config.json");
        fs::write(
            &cfg_path,
            format!(r#"{{"store": {{"kind": "sqlite", "path": {:?}}}}}"#, db.display().to_string()),
        )
        .unwrap();

        let config = Config::load(Some(&cfg_path)).unwrap();
        config.open_store().unwrap();
        assert!(db.exists());
    }
}
