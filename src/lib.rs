//! # Query Resilience
//!
//! This crate provides a resilient data-access layer in front of a remote
//! relational store. Reads are served from an in-memory TTL cache with tag
//! invalidation and LRU eviction; writes run through a transaction manager
//! with per-attempt timeouts and exponential-backoff retries.
//!
//! ## Key Components
//!
//! - `QueryCache`: TTL + tag + LRU result cache with hit/miss statistics
//! - `cache_key`: deterministic key generation and the shared tag names
//! - `CachedOperation` / `InvalidatingOperation`: memoising and invalidating wrappers
//! - `ConnectionPool`: bookkeeping of logical connections with a retention reaper
//! - `TransactionManager`: timeout race, retries and in-flight tracking
//! - `DatabaseService`: query, multi-statement, batch insert and health façade
//! - `IndexManager`: index catalogue, usage analysis and DDL
//! - `DataLayer`: one shared instance of everything above
//! - `StoreClient`: the seam to the remote store (`PgStoreClient` with the `postgres` feature)

mod cache;
pub mod cache_key;
mod config;
mod database;
mod decorator;
mod error;
mod index_manager;
mod layer;
mod pool;
mod traits;
mod transaction;

#[cfg(feature = "postgres")]
mod postgres;

pub use error::{DataError, DataResult, ErrorCode, StoreError, SERVICE_UNAVAILABLE_MESSAGE};
pub use traits::{QueryResult, StoreClient};
pub use cache::{CacheConfig, CacheEntry, CacheStatistics, CacheStats, QueryCache};
pub use cache_key::{generate_key, tags};
pub use decorator::{CacheOptions, CachedOperation, InvalidatingOperation, KeyGenerator};
pub use pool::{ConnectionLease, ConnectionPool, PoolConfig, PoolStats, PooledConnection, DEFAULT_CONNECTION};
pub use transaction::{
    IsolationLevel,
    TransactionConfig,
    TransactionContext,
    TransactionManager,
    TransactionOptions,
    TransactionStats,
};
pub use database::{
    BatchInsertResult,
    DatabaseConfig,
    DatabaseService,
    HealthStatus,
    QueryOptions,
    Statement,
};
pub use index_manager::{
    default_access_patterns,
    default_indexes,
    AccessPattern,
    IndexAnalysis,
    IndexInfo,
    IndexManager,
    IndexManagerConfig,
    IndexStats,
    IndexType,
    IndexUsageSample,
    OptimizationRecommendations,
};
pub use config::{
    CacheSettings,
    DataLayerConfig,
    DatabaseSettings,
    IndexSettings,
    PoolSettings,
    TransactionSettings,
};
pub use layer::DataLayer;

#[cfg(feature = "postgres")]
pub use postgres::PgStoreClient;
