use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DataResult, StoreError};

/// Rows or affected-row count returned by a store operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows, one JSON object per row
    pub rows: Vec<Value>,
    /// Number of rows written by a mutating statement
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Value>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// Decodes every row into `T`.
    pub fn rows_as<T: DeserializeOwned>(&self) -> DataResult<Vec<T>> {
        self.rows
            .iter()
            .map(|row| serde_json::from_value(row.clone()).map_err(Into::into))
            .collect()
    }
}

/// A client for the remote store.
///
/// Implementations run one parameterised statement and report either a
/// [`QueryResult`] or a [`StoreError`]. Parameters are positional (`$1`, `$2`, ...).
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryResult, StoreError>;
}
