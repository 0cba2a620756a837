use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{DataError, DataResult};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};

/// Transaction isolation level requested from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, e.g. `READ COMMITTED`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Per-transaction settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    /// Deadline for each attempt
    pub timeout: Duration,
    /// Maximum number of attempts; zero is treated as one
    pub retries: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            timeout: Duration::from_secs(30),
            retries: 3,
        }
    }
}

impl TransactionOptions {
    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

/// Bookkeeping record for one in-flight transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionContext {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub options: TransactionOptions,
    /// 1-based attempt number of the current run
    pub attempt: u32,
}

/// Configuration for TransactionManager
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionConfig {
    /// Delay before the second attempt; doubles for each further attempt
    pub backoff_base: Duration,
    pub pool: PoolConfig,
    /// Options callers start from when they set none of their own
    pub defaults: TransactionOptions,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            pool: PoolConfig::default(),
            defaults: TransactionOptions::default(),
        }
    }
}

impl TransactionConfig {
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_defaults(mut self, defaults: TransactionOptions) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Counters reported by [`TransactionManager::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub active_transactions: usize,
    pub total_connections: usize,
    pub active_connections: usize,
}

/// Runs units of work with a per-attempt timeout and exponential-backoff
/// retries, tracking each one while it is in flight.
#[derive(Debug)]
pub struct TransactionManager {
    in_flight: RwLock<HashMap<String, TransactionContext>>,
    pool: Arc<ConnectionPool>,
    config: TransactionConfig,
}

impl TransactionManager {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            in_flight: RwLock::new(HashMap::new()),
            pool: Arc::new(ConnectionPool::new(config.pool.clone())),
            config,
        }
    }

    /// Runs `operation` inside a tracked transaction.
    ///
    /// Each attempt races the operation against `options.timeout`; a lost
    /// race drops the operation future, so the store call is cancelled at its
    /// next suspension point. Failed attempts, timeouts included, are retried
    /// after `backoff_base * 2^(attempt - 1)` until `options.retries` attempts
    /// are used up, and the last error is returned.
    pub async fn execute_in_transaction<T, F, Fut>(
        &self,
        operation: F,
        options: TransactionOptions,
    ) -> DataResult<T>
    where
        F: Fn(TransactionContext) -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        let context = TransactionContext {
            id: format!("txn_{}", Uuid::new_v4().simple()),
            start_time: Utc::now(),
            options,
            attempt: 1,
        };
        let span = info_span!("transaction", id = %context.id);

        // unregisters and frees the connection however the future ends
        let _in_flight = InFlight::register(self, &context);

        async {
            info!("Starting transaction: {}", context.id);
            let started = Instant::now();

            match self.with_retry(&operation, &context).await {
                Ok(result) => {
                    info!("Transaction completed: {} in {:?}", context.id, started.elapsed());
                    Ok(result)
                }
                Err(e) => {
                    error!("Transaction failed: {}: {}", context.id, e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &F, context: &TransactionContext) -> DataResult<T>
    where
        F: Fn(TransactionContext) -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        let max_attempts = context.options.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_context = TransactionContext {
                attempt,
                ..context.clone()
            };

            match self.with_timeout(operation(attempt_context), context).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt >= max_attempts => {
                    warn!("Transaction {} failed after {} attempts", context.id, attempt);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Transaction {} attempt {} failed, retrying in {:?}: {}",
                        context.id, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn with_timeout<T, Fut>(&self, operation: Fut, context: &TransactionContext) -> DataResult<T>
    where
        Fut: Future<Output = DataResult<T>>,
    {
        let timeout = context.options.timeout;
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(DataError::Timeout {
                id: context.id.clone(),
                timeout,
            }),
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config.backoff_base.saturating_mul(1u32 << exponent)
    }

    /// Snapshot of the transactions currently in flight
    pub fn active_transactions(&self) -> Vec<TransactionContext> {
        self.in_flight.read().values().cloned().collect()
    }

    pub fn stats(&self) -> TransactionStats {
        let active_transactions = self.in_flight.read().len();
        Self::combine(active_transactions, self.pool.stats())
    }

    /// Like [`stats`](Self::stats), but returns None if either map stays
    /// locked for longer than `wait`
    pub fn try_stats(&self, wait: Duration) -> Option<TransactionStats> {
        let active_transactions = self.in_flight.try_read_for(wait)?.len();
        let pool = self.pool.try_stats(wait)?;
        Some(Self::combine(active_transactions, pool))
    }

    /// The configured default options
    pub fn default_options(&self) -> TransactionOptions {
        self.config.defaults
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    fn combine(active_transactions: usize, pool: PoolStats) -> TransactionStats {
        TransactionStats {
            active_transactions,
            total_connections: pool.total,
            active_connections: pool.active,
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TransactionConfig::default())
    }
}

struct InFlight<'a> {
    manager: &'a TransactionManager,
    id: String,
}

impl<'a> InFlight<'a> {
    fn register(manager: &'a TransactionManager, context: &TransactionContext) -> Self {
        manager
            .in_flight
            .write()
            .insert(context.id.clone(), context.clone());
        manager.pool.get_connection(&context.id);
        Self {
            manager,
            id: context.id.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.manager.in_flight.write().remove(&self.id);
        // transaction ids are single use
        self.manager.pool.remove_connection(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_options() {
        let options = TransactionOptions::default();
        assert_eq!(options.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.retries, 3);
        assert_eq!(options.isolation_level.to_string(), "READ COMMITTED");
    }

    #[test]
    fn test_backoff_doubles() {
        let manager = TransactionManager::default();
        assert_eq!(manager.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(manager.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(manager.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(manager.backoff_delay(4), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_is_registered_while_running() {
        let manager = TransactionManager::default();

        let seen = manager
            .execute_in_transaction(
                |context| {
                    let active = manager.active_transactions();
                    let connection = manager.pool().get(&context.id);
                    async move { Ok((context, active, connection)) }
                },
                TransactionOptions::default(),
            )
            .await
            .unwrap();

        let (context, active, connection) = seen;
        assert!(context.id.starts_with("txn_"));
        assert_eq!(context.attempt, 1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, context.id);
        assert!(connection.unwrap().is_active);

        assert_eq!(manager.stats(), TransactionStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_is_removed_after_failure() {
        let manager = TransactionManager::default();

        let result: DataResult<()> = manager
            .execute_in_transaction(
                |_| async { Err(DataError::database("boom")) },
                TransactionOptions::default().with_retries(1),
            )
            .await;

        assert_eq!(result, Err(DataError::database("boom")));
        assert!(manager.active_transactions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let manager = TransactionManager::default();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = manager
            .execute_in_transaction(
                |context| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if context.attempt < 3 {
                            Err(DataError::database(format!("attempt {}", context.attempt)))
                        } else {
                            Ok(context.attempt)
                        }
                    }
                },
                TransactionOptions::default(),
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_is_surfaced() {
        let manager = TransactionManager::default();

        let result: DataResult<()> = manager
            .execute_in_transaction(
                |context| async move { Err(DataError::database(format!("attempt {}", context.attempt))) },
                TransactionOptions::default().with_retries(3),
            )
            .await;

        assert_eq!(result, Err(DataError::database("attempt 3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_the_race() {
        let manager = TransactionManager::default();
        let started = Instant::now();

        let result: DataResult<()> = manager
            .execute_in_transaction(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                },
                TransactionOptions::default()
                    .with_timeout(Duration::from_secs(2))
                    .with_retries(1),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let manager = TransactionManager::default();
        let attempts = AtomicU32::new(0);

        let result: DataResult<()> = manager
            .execute_in_transaction(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(DataError::database("nope")) }
                },
                TransactionOptions::default().with_retries(0),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_stats_gives_up_when_locked() {
        let manager = TransactionManager::default();
        let guard = manager.in_flight.write();

        assert_eq!(manager.try_stats(Duration::from_millis(5)), None);
        drop(guard);

        assert_eq!(manager.try_stats(Duration::from_millis(5)), Some(TransactionStats::default()));
    }
}
