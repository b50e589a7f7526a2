use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    Connection, PgPool, Row,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{
    validate_ident, DetailRecord, DetailTable, EntityTable, MergeOutcome, MergePlan,
    PrimaryEntity, Store, StoreError,
};
use crate::util::env::env_flag;

/// Direct Postgres access. The only backend that can wrap a group merge in a
/// transaction.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    let _ = sqlx::query("SET application_name = 'forest_admin'")
                        .persistent(false)
                        .execute(&mut *conn)
                        .await;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }
}

/// `schema.table` -> `"schema"."table"`, doubling any embedded quote.
fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn split_table(table: &str) -> (&str, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (schema, name),
        None => ("public", table),
    }
}

/// Assigning a text parameter to a column of unknown type: route it through
/// the table's own row type so Postgres applies the column's input cast.
fn repoint_sql(table: &str, column: &str) -> String {
    let t = quote_ident(table);
    let c = quote_ident(column);
    format!(
        "UPDATE {t} SET {c} = (json_populate_record(NULL::{t}, json_build_object('{column}', $1::text))).{c} WHERE {c}::text = $2"
    )
}

fn delete_one_sql(table: &str, id_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {}::text = $1",
        quote_ident(table),
        quote_ident(id_column)
    )
}

fn patch_columns(patch: &Map<String, Value>) -> Result<Vec<String>, StoreError> {
    if patch.is_empty() {
        return Err(StoreError::Config("empty row payload".into()));
    }
    patch
        .keys()
        .map(|k| validate_ident(k).map(|_| quote_ident(k)))
        .collect()
}

#[async_trait]
impl Store for Db {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn check_columns(&self, table: &str, columns: &[&str]) -> Result<(), StoreError> {
        validate_ident(table)?;
        let (schema, name) = split_table(table);
        let present: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2",
        )
        .persistent(false)
        .bind(schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        if present.is_empty() {
            return Err(StoreError::Config(format!("table {table} does not exist")));
        }
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !present.iter().any(|p| p.as_str() == *c))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Config(format!(
                "table {table} has no column(s) {missing:?}"
            )));
        }
        Ok(())
    }

    async fn fetch_entities(&self, spec: &EntityTable) -> Result<Vec<PrimaryEntity>, StoreError> {
        let id = quote_ident(&spec.id_column);
        let created = spec
            .created_column
            .as_deref()
            .map(|c| format!("{}::timestamptz", quote_ident(c)))
            .unwrap_or_else(|| "NULL::timestamptz".into());
        let sql = format!(
            "SELECT {id}::text AS id, {}::text AS name, {created} AS created_at FROM {} ORDER BY {id}",
            quote_ident(&spec.name_column),
            quote_ident(&spec.table),
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let name: Option<String> = r.try_get("name")?;
            out.push(PrimaryEntity {
                id: r.try_get("id")?,
                name: name.unwrap_or_default(),
                created_at: r.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
            });
        }
        debug!(table = %spec.table, rows = out.len(), "fetched primary entities");
        Ok(out)
    }

    async fn count_refs(&self, table: &str, column: &str, value: &str) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text = $1",
            quote_ident(table),
            quote_ident(column)
        );
        let n: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn repoint(
        &self,
        table: &str,
        column: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(&repoint_sql(table, column))
            .persistent(false)
            .bind(to)
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn delete_ids(
        &self,
        table: &str,
        id_column: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {}::text = ANY($1)",
            quote_ident(table),
            quote_ident(id_column)
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StoreError> {
        let c = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT {c}::text FROM {} WHERE {c} IS NOT NULL ORDER BY 1",
            quote_ident(table)
        );
        let values: Vec<String> = sqlx::query_scalar(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        Ok(values)
    }

    async fn fetch_details(&self, spec: &DetailTable) -> Result<Vec<DetailRecord>, StoreError> {
        let sql = format!(
            "SELECT {}::text AS id, {}::text AS owner_id, {}::timestamptz AS created_at FROM {} WHERE {} IS NOT NULL",
            quote_ident(&spec.id_column),
            quote_ident(&spec.owner_column),
            quote_ident(&spec.created_column),
            quote_ident(&spec.table),
            quote_ident(&spec.owner_column),
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(DetailRecord {
                id: r.try_get("id")?,
                owner_id: r.try_get("owner_id")?,
                created_at: r.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn delete_where(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(&delete_one_sql(table, column))
            .persistent(false)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn update_by_id(
        &self,
        table: &str,
        id_column: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let cols = patch_columns(patch)?.join(", ");
        let t = quote_ident(table);
        let sql = format!(
            "UPDATE {t} SET ({cols}) = (SELECT {cols} FROM json_populate_record(NULL::{t}, $1::json)) WHERE {}::text = $2",
            quote_ident(id_column)
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(sqlx::types::Json(Value::Object(patch.clone())))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn insert_row(&self, table: &str, row: &Map<String, Value>) -> Result<(), StoreError> {
        let cols = patch_columns(row)?.join(", ");
        let t = quote_ident(table);
        let sql = format!(
            "INSERT INTO {t} ({cols}) SELECT {cols} FROM json_populate_record(NULL::{t}, $1::json)"
        );
        sqlx::query(&sql)
            .persistent(false)
            .bind(sqlx::types::Json(Value::Object(row.clone())))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_in_transaction(
        &self,
        plan: &MergePlan,
    ) -> Result<Option<MergeOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = MergeOutcome::default();

        for dep in &plan.dependents {
            let sql = repoint_sql(&dep.table, &dep.fk_column);
            let mut total = 0u64;
            for loser in &plan.loser_ids {
                let res = sqlx::query(&sql)
                    .persistent(false)
                    .bind(&plan.keep_id)
                    .bind(loser)
                    .execute(&mut *tx)
                    .await?;
                total += res.rows_affected();
            }
            outcome.repointed.insert(dep.table.clone(), total);
        }

        // Each delete gets a savepoint so one constraint failure keeps the repoints.
        let delete_sql = delete_one_sql(&plan.entity.table, &plan.entity.id_column);
        for loser in &plan.loser_ids {
            let mut sp = tx.begin().await?;
            let res = sqlx::query(&delete_sql)
                .persistent(false)
                .bind(loser)
                .execute(&mut *sp)
                .await
                .map(|r| r.rows_affected())
                .map_err(StoreError::from);
            let step = LoserStep::from_delete(res);
            if step.keeps_savepoint() {
                sp.commit().await?;
            } else {
                sp.rollback().await?;
            }
            step.record(&mut outcome, &plan.key, loser)?;
        }

        tx.commit().await?;
        Ok(Some(outcome))
    }
}

/// How one loser's delete inside the merge transaction affects the group.
#[derive(Debug)]
enum LoserStep {
    Deleted { already_gone: bool },
    /// Savepoint rolled back, the rest of the group carries on.
    Rejected(StoreError),
    /// The whole transaction is dropped and the group retried or skipped.
    Abort(StoreError),
}

impl LoserStep {
    fn from_delete(res: Result<u64, StoreError>) -> Self {
        match res {
            Ok(n) => LoserStep::Deleted {
                already_gone: n == 0,
            },
            Err(e) if e.is_retryable() => LoserStep::Abort(e),
            Err(e) => LoserStep::Rejected(e),
        }
    }

    fn keeps_savepoint(&self) -> bool {
        matches!(self, LoserStep::Deleted { .. })
    }

    fn record(self, outcome: &mut MergeOutcome, key: &str, loser: &str) -> Result<(), StoreError> {
        match self {
            LoserStep::Deleted { already_gone } => {
                if already_gone {
                    debug!(key, id = loser, "loser already gone");
                }
                outcome.deleted.push(loser.to_string());
                Ok(())
            }
            LoserStep::Rejected(err) => {
                warn!(key, id = loser, error = %err, "delete rejected inside merge transaction");
                outcome.failed.push((loser.to_string(), err.to_string()));
                Ok(())
            }
            LoserStep::Abort(err) => Err(err),
        }
    }
}
