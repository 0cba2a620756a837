use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use query_resilience::{QueryResult, StoreClient, StoreError};
use serde_json::Value;

/// A statement as received by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub statement: String,
    pub params: Vec<Value>,
}

/// In-memory store that records statements and can be told to fail or stall
#[derive(Default)]
pub struct MemoryStore {
    executed: Mutex<Vec<Executed>>,
    /// Statements or string params containing one of these fail
    fail_on: Mutex<Vec<String>>,
    /// Number of upcoming calls that fail regardless of content
    fail_next: AtomicU32,
    stall: Mutex<Option<Duration>>,
    /// Canned rows returned for statements containing the pattern
    responses: Mutex<Vec<(String, Vec<Value>)>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, pattern: &str) {
        self.fail_on.lock().push(pattern.to_string());
    }

    pub fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn stall_for(&self, delay: Duration) {
        *self.stall.lock() = Some(delay);
    }

    pub fn respond_with(&self, pattern: &str, rows: Vec<Value>) {
        self.responses.lock().push((pattern.to_string(), rows));
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .map(|executed| executed.statement.clone())
            .collect()
    }

    fn should_fail(&self, statement: &str, params: &[Value]) -> bool {
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return true;
        }

        self.fail_on.lock().iter().any(|pattern| {
            statement.contains(pattern.as_str())
                || params
                    .iter()
                    .any(|param| param.as_str().is_some_and(|s| s.contains(pattern.as_str())))
        })
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryResult, StoreError> {
        let stall = *self.stall.lock();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        self.executed.lock().push(Executed {
            statement: statement.to_string(),
            params: params.to_vec(),
        });

        if self.should_fail(statement, params) {
            return Err(StoreError::new("duplicate key value violates unique constraint").with_code("23505"));
        }

        let canned = self
            .responses
            .lock()
            .iter()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone());
        match canned {
            Some(rows) => Ok(QueryResult::from_rows(rows)),
            None => Ok(QueryResult::affected(1)),
        }
    }
}
