use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{QueryResult, StoreClient};

/// [`StoreClient`] backed by a sqlx Postgres pool.
///
/// Row-returning statements (`SELECT`, read-only `WITH`) are wrapped so that
/// each row comes back as one `jsonb` object; anything else reports the
/// number of rows it touched. A `WITH` statement mentioning `INSERT`,
/// `UPDATE`, `DELETE` or `MERGE` anywhere, string literals included, runs
/// unwrapped: its `RETURNING` rows are not surfaced, only the count.
///
/// Parameters bind by JSON kind: booleans as `bool`, integers as `int8`,
/// other numbers as `float8`, strings and `null` as `text`, arrays and
/// objects as `jsonb`. Statements writing into columns of other types
/// should cast their placeholders, e.g. `$1::timestamptz`.
#[derive(Debug, Clone)]
pub struct PgStoreClient {
    pool: PgPool,
}

impl PgStoreClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections` to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreClient for PgStoreClient {
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryResult, StoreError> {
        if returns_rows(statement) {
            let inner = statement.trim_end().trim_end_matches(';');
            let wrapped = format!("SELECT to_jsonb(q) AS row FROM ({inner}) q");
            let rows = bind_params(sqlx::query(&wrapped), params)
                .fetch_all(&self.pool)
                .await?;
            let rows = rows
                .iter()
                .map(|row| row.try_get::<Value, _>("row"))
                .collect::<Result<Vec<_>, _>>()?;

            debug!("Fetched {} rows", rows.len());
            Ok(QueryResult::from_rows(rows))
        } else {
            let done = bind_params(sqlx::query(statement), params)
                .execute(&self.pool)
                .await?;
            Ok(QueryResult::affected(done.rows_affected()))
        }
    }
}

fn returns_rows(statement: &str) -> bool {
    let mut words = statement
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty());
    match words.next() {
        Some(head) if head.eq_ignore_ascii_case("select") => true,
        // Postgres only allows data-modifying CTEs at the top level
        Some(head) if head.eq_ignore_ascii_case("with") => !words.any(|word| {
            ["insert", "update", "delete", "merge"]
                .iter()
                .any(|keyword| word.eq_ignore_ascii_case(keyword))
        }),
        _ => false,
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<&str>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(Json(other)),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  select * from words"));
        assert!(returns_rows("WITH recent AS (SELECT 1) SELECT * FROM recent"));
        assert!(returns_rows("with updated_words as (select 1) select * from updated_words"));
        assert!(!returns_rows(
            "WITH moved AS (DELETE FROM a RETURNING *) INSERT INTO b SELECT * FROM moved"
        ));
        assert!(!returns_rows("with x as (select 1) update t set a = 1 returning *"));
        assert!(!returns_rows("WITH x AS (SELECT 1)\nMERGE INTO t USING x ON true WHEN MATCHED THEN DO NOTHING"));
        assert!(!returns_rows("INSERT INTO words (word) VALUES ($1)"));
        assert!(!returns_rows("SELECTION"));
        assert!(!returns_rows("REINDEX INDEX \"idx_words_search\""));
    }
}
