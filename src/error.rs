use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Message higher layers show instead of the underlying error text.
pub const SERVICE_UNAVAILABLE_MESSAGE: &str =
    "The service is temporarily unavailable, please try again";

/// Stable classification of a [`DataError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    DatabaseError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for data-access operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    /// The deadline elapsed before the transaction or query settled
    #[error("{id} timed out after {}ms", .timeout.as_millis())]
    Timeout { id: String, timeout: Duration },

    /// Any failure reported by the remote store, normalised
    #[error("Database query failed: {message}")]
    Database { message: String },
}

impl DataError {
    pub fn database(message: impl Into<String>) -> Self {
        DataError::Database {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DataError::Timeout { .. } => ErrorCode::Timeout,
            DataError::Database { .. } => ErrorCode::DatabaseError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DataError::Timeout { .. })
    }

    /// Text safe to show to end users; never contains store output.
    pub fn user_message(&self) -> &'static str {
        SERVICE_UNAVAILABLE_MESSAGE
    }
}

/// Result type for data-access operations
pub type DataResult<T> = Result<T, DataError>;

/// Raw error reported by a [`StoreClient`](crate::StoreClient).
///
/// Only store clients construct this; `DatabaseService` converts it into a
/// [`DataError`] before anything reaches its callers.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
    code: Option<String>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attaches the vendor error code (e.g. a SQLSTATE)
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Conversion from StoreError to DataError
impl From<StoreError> for DataError {
    fn from(err: StoreError) -> Self {
        match err.code {
            Some(code) => DataError::database(format!("{} ({code})", err.message)),
            None => DataError::database(err.message),
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::database(format!("Failed to decode JSON: {err}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };
        let store_error = StoreError::new(err.to_string());
        match code {
            Some(code) => store_error.with_code(code),
            None => store_error,
        }
    }
}
