use thiserror::Error;

/// Failure of a single remote call, classified so callers can decide whether
/// to retry, skip the row, or abort the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network, timeout, pool exhaustion, 5xx. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),
    /// Unique / foreign-key / not-null violation on a specific row.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Unknown table/column or bad identifiers. Fatal before any write.
    #[error("configuration: {0}")]
    Config(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("other: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Errors that must stop the whole run rather than one group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Config(_) | StoreError::Auth(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Transient(_) => "transient",
            StoreError::Constraint(_) => "constraint",
            StoreError::NotFound(_) => "not_found",
            StoreError::Config(_) => "config",
            StoreError::Auth(_) => "auth",
            StoreError::Other(_) => "other",
        }
    }

    /// Map a Postgres SQLSTATE to the taxonomy. Shared by the sqlx and REST
    /// backends since PostgREST forwards the SQLSTATE in its error body.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let msg = format!("{code}: {}", message.into());
        match code {
            c if c.starts_with("23") => StoreError::Constraint(msg),
            // undefined_table, undefined_column, invalid_schema_name, PostgREST schema cache misses
            "42P01" | "42703" | "3F000" | "PGRST200" | "PGRST204" | "PGRST205" => {
                StoreError::Config(msg)
            }
            // serialization_failure, deadlock_detected, query_canceled, too_many_connections
            "40001" | "40P01" | "57014" | "53300" | "57P01" => StoreError::Transient(msg),
            "28P01" | "28000" | "42501" => StoreError::Auth(msg),
            c if c.starts_with("08") => StoreError::Transient(msg),
            _ => StoreError::Other(msg),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                StoreError::from_sqlstate(&code, db_err.message())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::ColumnNotFound(col) => {
                StoreError::Config(format!("column not found in result: {col}"))
            }
            sqlx::Error::Configuration(_) => StoreError::Config(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            _ => StoreError::Other(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            StoreError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                StoreError::Transient(err.to_string())
            } else {
                StoreError::Other(err.to_string())
            }
        } else {
            StoreError::Other(err.to_string())
        }
    }
}
