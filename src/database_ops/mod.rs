//! Data-access seam for the reconciliation routine.
//!
//! Both backends (direct Postgres and PostgREST over HTTP) expose the same
//! handful of request/response calls through [`Store`]. Table and column
//! names arrive from configuration, so they are validated with
//! [`validate_ident`] before a backend ever formats them into a query.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

pub mod db;
pub mod error;
#[cfg(test)]
pub mod memory;
pub mod rest;

pub use error::StoreError;

/// A deduplication target, e.g. one administrative region row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimaryEntity {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// One relation holding a foreign key into the primary table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependentRef {
    pub table: String,
    pub fk_column: String,
}

impl DependentRef {
    pub fn new(table: impl Into<String>, fk_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fk_column: fk_column.into(),
        }
    }
}

impl std::fmt::Display for DependentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.fk_column)
    }
}

/// Column mapping for the primary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTable {
    pub table: String,
    pub id_column: String,
    pub name_column: String,
    pub created_column: Option<String>,
}

impl EntityTable {
    pub fn columns(&self) -> Vec<&str> {
        let mut cols = vec![self.id_column.as_str(), self.name_column.as_str()];
        if let Some(c) = self.created_column.as_deref() {
            cols.push(c);
        }
        cols
    }
}

/// Column mapping for a one-to-one child table (unique on `owner_column`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailTable {
    pub table: String,
    pub id_column: String,
    pub owner_column: String,
    pub created_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailRecord {
    pub id: String,
    pub owner_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Everything needed to merge one duplicate group.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub key: String,
    pub keep_id: String,
    pub loser_ids: Vec<String>,
    pub entity: EntityTable,
    pub dependents: Vec<DependentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Rows repointed per dependent table, in configuration order.
    pub repointed: IndexMap<String, u64>,
    pub deleted: Vec<String>,
    /// (loser id, error) for deletes that did not go through.
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Config error when the table or any of the columns is unknown.
    async fn check_columns(&self, table: &str, columns: &[&str]) -> Result<(), StoreError>;

    async fn fetch_entities(&self, spec: &EntityTable) -> Result<Vec<PrimaryEntity>, StoreError>;

    async fn count_refs(&self, table: &str, column: &str, value: &str) -> Result<u64, StoreError>;

    /// `UPDATE table SET column = to WHERE column = from`; returns rows affected.
    async fn repoint(
        &self,
        table: &str,
        column: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError>;

    async fn delete_ids(
        &self,
        table: &str,
        id_column: &str,
        ids: &[String],
    ) -> Result<u64, StoreError>;

    /// Distinct non-null values of `column`, as text.
    async fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StoreError>;

    async fn fetch_details(&self, spec: &DetailTable) -> Result<Vec<DetailRecord>, StoreError>;

    async fn delete_where(&self, table: &str, column: &str, value: &str)
        -> Result<u64, StoreError>;

    async fn update_by_id(
        &self,
        table: &str,
        id_column: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, StoreError>;

    async fn insert_row(&self, table: &str, row: &Map<String, Value>) -> Result<(), StoreError>;

    /// Repoint + purge for one group inside a single transaction. `None` when
    /// the backend has no transactions and the caller must run the steps itself.
    async fn merge_in_transaction(
        &self,
        _plan: &MergePlan,
    ) -> Result<Option<MergeOutcome>, StoreError> {
        Ok(None)
    }
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and `_`.
pub fn validate_ident(ident: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = ident.split('.').collect();
    let well_formed = parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty()
                && !p.starts_with(|c: char| c.is_ascii_digit())
                && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if well_formed {
        Ok(())
    } else {
        Err(StoreError::Config(format!("invalid identifier: {ident:?}")))
    }
}

/// Opaque ids come back as JSON strings or numbers depending on column type.
pub(crate) fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// RFC 3339 first, then the naive forms PostgREST emits for `timestamp` columns.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}
