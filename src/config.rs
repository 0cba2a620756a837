//! Deserializable configuration for the whole data layer.
//!
//! Durations are expressed in milliseconds (`*_ms` keys). Every section and
//! every field is optional and falls back to the component defaults:
//!
//! ```json
//! {
//!   "cache": { "default_ttl_ms": 300000, "max_size": 1000 },
//!   "transaction": { "timeout_ms": 30000, "retries": 3 },
//!   "database": { "query_timeout_ms": 15000 }
//! }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::database::DatabaseConfig;
use crate::error::DataResult;
use crate::index_manager::IndexManagerConfig;
use crate::pool::PoolConfig;
use crate::transaction::{IsolationLevel, TransactionConfig, TransactionOptions};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub max_size: usize,
    pub cleanup_interval_ms: u64,
    pub eviction_fraction: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            default_ttl_ms: millis(defaults.default_ttl),
            max_size: defaults.max_size,
            cleanup_interval_ms: millis(defaults.cleanup_interval),
            eviction_fraction: defaults.eviction_fraction,
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        CacheConfig::new(
            Duration::from_millis(settings.default_ttl_ms),
            settings.max_size,
        )
        .with_cleanup_interval(Duration::from_millis(settings.cleanup_interval_ms))
        .with_eviction_fraction(settings.eviction_fraction)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub retention_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            retention_ms: millis(defaults.retention),
            reap_interval_ms: millis(defaults.reap_interval),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig::default()
            .with_retention(Duration::from_millis(settings.retention_ms))
            .with_reap_interval(Duration::from_millis(settings.reap_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    pub isolation_level: IsolationLevel,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        let options = TransactionOptions::default();
        Self {
            isolation_level: options.isolation_level,
            timeout_ms: millis(options.timeout),
            retries: options.retries,
            backoff_base_ms: millis(TransactionConfig::default().backoff_base),
        }
    }
}

impl TransactionSettings {
    /// Options applied to transactions started without explicit ones
    pub fn options(&self) -> TransactionOptions {
        TransactionOptions::default()
            .with_isolation_level(self.isolation_level)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_retries(self.retries)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub query_timeout_ms: u64,
    pub health_check_wait_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            query_timeout_ms: millis(defaults.query_timeout),
            health_check_wait_ms: millis(defaults.health_check_wait),
        }
    }
}

impl From<&DatabaseSettings> for DatabaseConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        DatabaseConfig {
            query_timeout: Duration::from_millis(settings.query_timeout_ms),
            health_check_wait: Duration::from_millis(settings.health_check_wait_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub unused_usage_threshold: f64,
    pub inefficient_threshold: f64,
    /// Absent or zero disables periodic analysis
    pub analysis_interval_ms: Option<u64>,
    /// Seed the registry with the built-in index catalogue
    pub register_defaults: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        let defaults = IndexManagerConfig::default();
        Self {
            unused_usage_threshold: defaults.unused_usage_threshold,
            inefficient_threshold: defaults.inefficient_threshold,
            analysis_interval_ms: defaults.analysis_interval.map(millis),
            register_defaults: true,
        }
    }
}

impl From<&IndexSettings> for IndexManagerConfig {
    fn from(settings: &IndexSettings) -> Self {
        IndexManagerConfig {
            unused_usage_threshold: settings.unused_usage_threshold,
            inefficient_threshold: settings.inefficient_threshold,
            analysis_interval: settings
                .analysis_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }
}

/// Configuration for [`DataLayer`](crate::DataLayer)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DataLayerConfig {
    pub cache: CacheSettings,
    pub pool: PoolSettings,
    pub transaction: TransactionSettings,
    pub database: DatabaseSettings,
    pub indexes: IndexSettings,
}

impl DataLayerConfig {
    pub fn from_json(json: &str) -> DataResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }

    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig::default()
            .with_backoff_base(Duration::from_millis(self.transaction.backoff_base_ms))
            .with_pool(PoolConfig::from(&self.pool))
            .with_defaults(self.transaction.options())
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig::from(&self.database)
    }

    pub fn index_config(&self) -> IndexManagerConfig {
        IndexManagerConfig::from(&self.indexes)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
