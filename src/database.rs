use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DataError, DataResult};
use crate::traits::{QueryResult, StoreClient};
use crate::transaction::{TransactionContext, TransactionManager};

/// Configuration for DatabaseService
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Deadline for a single statement when the caller sets none
    pub query_timeout: Duration,
    /// How long a health check waits for the bookkeeping locks
    pub health_check_wait: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(15),
            health_check_wait: Duration::from_millis(50),
        }
    }
}

impl DatabaseConfig {
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn with_health_check_wait(mut self, health_check_wait: Duration) -> Self {
        self.health_check_wait = health_check_wait;
        self
    }
}

/// Per-call options for [`DatabaseService::execute_query`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    /// Run through the transaction manager, with retries
    pub use_transaction: bool,
}

impl QueryOptions {
    pub fn transactional() -> Self {
        Self {
            use_transaction: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// One statement of a multi-statement transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub query: String,
    pub params: Vec<Value>,
    pub timeout: Option<Duration>,
}

impl Statement {
    pub fn new(query: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            params,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a best-effort batch insert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchInsertResult {
    pub inserted: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub connections: usize,
    pub active_transactions: usize,
    pub timestamp: DateTime<Utc>,
}

/// Facade that runs statements against the remote store, directly or inside
/// managed transactions, and hides store errors behind [`DataError`].
pub struct DatabaseService {
    client: Arc<dyn StoreClient>,
    transactions: Arc<TransactionManager>,
    config: DatabaseConfig,
}

impl DatabaseService {
    pub fn new(
        client: Arc<dyn StoreClient>,
        transactions: Arc<TransactionManager>,
        config: DatabaseConfig,
    ) -> Self {
        Self {
            client,
            transactions,
            config,
        }
    }

    /// Runs one statement. Only `use_transaction` calls are retried.
    ///
    /// Transactional calls start from the transaction manager's default
    /// options; `options.timeout` and `options.retries` override them.
    pub async fn execute_query(
        &self,
        query: &str,
        params: &[Value],
        options: QueryOptions,
    ) -> DataResult<QueryResult> {
        let timeout = options.timeout.unwrap_or(self.config.query_timeout);

        if options.use_transaction {
            let defaults = self.transactions.default_options();
            let transaction_options = defaults
                .with_timeout(options.timeout.unwrap_or(defaults.timeout))
                .with_retries(options.retries.unwrap_or(defaults.retries));

            return self
                .transactions
                .execute_in_transaction(
                    move |context| async move {
                        self.execute_internal(query, params, timeout, Some(&context)).await
                    },
                    transaction_options,
                )
                .await;
        }

        self.execute_internal(query, params, timeout, None).await
    }

    /// Runs every statement in order inside one transaction context.
    ///
    /// Any failure fails the whole call; statements that already ran are not
    /// undone unless the store itself rolls them back.
    pub async fn execute_transaction(&self, statements: &[Statement]) -> DataResult<Vec<QueryResult>> {
        let timeout = self
            .config
            .query_timeout
            .saturating_mul(statements.len().max(1) as u32);
        let options = self.transactions.default_options().with_timeout(timeout);

        self.transactions
            .execute_in_transaction(
                move |context| async move {
                    let mut results = Vec::with_capacity(statements.len());
                    for statement in statements {
                        let timeout = statement.timeout.unwrap_or(self.config.query_timeout);
                        let result = self
                            .execute_internal(&statement.query, &statement.params, timeout, Some(&context))
                            .await?;
                        results.push(result);
                    }
                    Ok::<_, DataError>(results)
                },
                options,
            )
            .await
    }

    /// Inserts `records` one at a time inside a single transaction.
    ///
    /// Each record must be a JSON object; its keys become the column list.
    /// A failing record is reported in `errors` and the rest still run. The
    /// batch makes a single attempt since inserts are not idempotent.
    pub async fn batch_insert(&self, table: &str, records: &[Value], options: QueryOptions) -> BatchInsertResult {
        let timeout = options.timeout.unwrap_or(self.config.query_timeout);
        let batch_timeout = timeout.saturating_mul(records.len().max(1) as u32);
        let progress = Mutex::new(BatchInsertResult::default());
        let tally = &progress;

        let outcome = self
            .transactions
            .execute_in_transaction(
                move |context| async move {
                    for (index, record) in records.iter().enumerate() {
                        let outcome = match insert_statement(table, record) {
                            Ok((query, params)) => self
                                .execute_internal(&query, &params, timeout, Some(&context))
                                .await
                                .map(|_| ()),
                            Err(e) => Err(e),
                        };
                        let mut tally = tally.lock();
                        match outcome {
                            Ok(()) => tally.inserted += 1,
                            Err(e) => tally
                                .errors
                                .push(format!("Failed to insert record {index}: {e}")),
                        }
                    }
                    Ok::<_, DataError>(())
                },
                self.transactions
                    .default_options()
                    .with_timeout(batch_timeout)
                    .with_retries(1),
            )
            .await;

        let mut result = progress.into_inner();
        if let Err(e) = outcome {
            result.errors.push(format!("Batch insert transaction failed: {e}"));
        }
        if !result.errors.is_empty() {
            warn!(
                "Batch insert into {}: {} inserted, {} failed",
                table,
                result.inserted,
                result.errors.len()
            );
        }
        result
    }

    /// Reports pool and transaction counters; never fails
    pub fn get_health_status(&self) -> HealthStatus {
        match self.transactions.try_stats(self.config.health_check_wait) {
            Some(stats) => HealthStatus {
                healthy: true,
                connections: stats.active_connections,
                active_transactions: stats.active_transactions,
                timestamp: Utc::now(),
            },
            None => {
                warn!("Health check could not read transaction counters");
                HealthStatus {
                    healthy: false,
                    connections: 0,
                    active_transactions: 0,
                    timestamp: Utc::now(),
                }
            }
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Single funnel for every statement: traces, times and normalises errors
    async fn execute_internal(
        &self,
        query: &str,
        params: &[Value],
        timeout: Duration,
        context: Option<&TransactionContext>,
    ) -> DataResult<QueryResult> {
        let query_id = format!("query_{}", Uuid::new_v4().simple());
        let started = Instant::now();

        // transactions hold their own connection for their whole lifetime
        let _lease = match context {
            Some(_) => None,
            None => Some(self.transactions.pool().acquire_scoped(&query_id)),
        };

        debug!(
            "Executing query: {} (transaction: {})",
            query_id,
            context.map_or("none", |c| c.id.as_str())
        );

        match tokio::time::timeout(timeout, self.client.execute(query, params)).await {
            Ok(Ok(result)) => {
                debug!("Query completed: {} in {:?}", query_id, started.elapsed());
                Ok(result)
            }
            Ok(Err(e)) => {
                error!("Query failed: {} after {:?}: {}", query_id, started.elapsed(), e);
                Err(e.into())
            }
            Err(_) => {
                error!("Query timed out: {} after {:?}", query_id, timeout);
                Err(DataError::Timeout {
                    id: query_id,
                    timeout,
                })
            }
        }
    }
}

/// `INSERT INTO "table" ("a", "b") VALUES ($1, $2)` for a JSON object record
fn insert_statement(table: &str, record: &Value) -> DataResult<(String, Vec<Value>)> {
    let Value::Object(fields) = record else {
        return Err(DataError::database("record is not a JSON object"));
    };
    if fields.is_empty() {
        return Err(DataError::database("record has no fields"));
    }

    let mut columns: Vec<(&String, &Value)> = fields.iter().collect();
    columns.sort_by(|a, b| a.0.cmp(b.0));

    let mut names = Vec::with_capacity(columns.len());
    for (name, _) in &columns {
        names.push(quote_identifier(name)?);
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let params = columns.into_iter().map(|(_, value)| value.clone()).collect();

    let query = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table)?,
        names.join(", "),
        placeholders.join(", ")
    );
    Ok((query, params))
}

/// Quotes a table or column name, rejecting anything but `[A-Za-z0-9_]`
pub(crate) fn quote_identifier(name: &str) -> DataResult<String> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(DataError::database(format!("invalid identifier: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingStore;

    #[async_trait]
    impl StoreClient for FailingStore {
        async fn execute(&self, _statement: &str, _params: &[Value]) -> Result<QueryResult, StoreError> {
            Err(StoreError::new("connection reset by peer").with_code("08006"))
        }
    }

    fn service(client: Arc<dyn StoreClient>) -> DatabaseService {
        DatabaseService::new(client, Arc::new(TransactionManager::default()), DatabaseConfig::default())
    }

    #[test]
    fn test_insert_statement() {
        let (query, params) =
            insert_statement("words", &json!({"word": "skeer", "definition": "broke"})).unwrap();

        assert_eq!(
            query,
            "INSERT INTO \"words\" (\"definition\", \"word\") VALUES ($1, $2)"
        );
        assert_eq!(params, vec![json!("broke"), json!("skeer")]);
    }

    #[test]
    fn test_insert_statement_rejects_bad_input() {
        assert!(insert_statement("words", &json!(["skeer"])).is_err());
        assert!(insert_statement("words", &json!({})).is_err());
        assert!(insert_statement("words; DROP TABLE users", &json!({"word": "x"})).is_err());
        assert!(insert_statement("words", &json!({"word\"": "x"})).is_err());
    }

    #[tokio::test]
    async fn test_store_errors_are_wrapped() {
        let db = service(Arc::new(FailingStore));

        let err = db
            .execute_query("SELECT 1", &[], QueryOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DataError::database("connection reset by peer (08006)")
        );
        assert_eq!(db.transactions().pool().stats().active, 0);
    }

    #[test]
    fn test_health_degrades_when_counters_are_locked() {
        let db = service(Arc::new(FailingStore));
        let _guard = db.transactions.pool().lock_connections();

        let status = db.get_health_status();
        assert!(!status.healthy);
        assert_eq!(status.connections, 0);
        assert_eq!(status.active_transactions, 0);
    }
}
