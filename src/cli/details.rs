use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::{connect_store, StoreConfig};
use crate::database_ops::{validate_ident, DetailTable};
use crate::reconcile::detail::{dedupe_details, rewrite_dependent, DependentUpdate};
use crate::util::env as env_util;
use crate::util::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct DetailArgs {
    pub table: String,
    pub id_column: String,
    pub owner_column: String,
    pub created_column: String,
}

impl Default for DetailArgs {
    fn default() -> Self {
        Self {
            table: "institutions".into(),
            id_column: "id".into(),
            owner_column: "holding_id".into(),
            created_column: "created_at".into(),
        }
    }
}

impl DetailArgs {
    pub fn to_table(&self) -> Result<DetailTable> {
        for ident in [&self.table, &self.id_column, &self.owner_column, &self.created_column] {
            validate_ident(ident)?;
        }
        Ok(DetailTable {
            table: self.table.clone(),
            id_column: self.id_column.clone(),
            owner_column: self.owner_column.clone(),
            created_column: self.created_column.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetailsConfig {
    pub store: StoreConfig,
    pub detail: DetailArgs,
    pub dry_run: bool,
    pub json: bool,
}

pub async fn run(cfg: DetailsConfig) -> Result<i32> {
    env_util::init_env();
    let spec = cfg.detail.to_table()?;
    let dry_run = cfg.dry_run || env_util::env_flag("DRY_RUN", false);
    let store = connect_store(&cfg.store).await?;
    let report = dedupe_details(store.as_ref(), &spec, dry_run, &RetryPolicy::from_env())
        .await
        .with_context(|| format!("deduplicating {}", spec.table))?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code())
}

#[derive(Debug, Clone, Default)]
pub struct RewriteConfig {
    pub store: StoreConfig,
    pub detail: DetailArgs,
    pub dependent_table: String,
    pub dependent_id_column: String,
    pub id: String,
    /// `column=value` pairs applied to the dependent row.
    pub set: Vec<String>,
    /// `column=value` pairs for the detail row inserted when no trigger fires.
    pub detail_values: Vec<String>,
}

/// `status=verified` -> {"status": "verified"}; values that parse as JSON
/// scalars (numbers, booleans, null) keep their type.
pub fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for pair in pairs {
        let Some((col, raw)) = pair.split_once('=') else {
            bail!("expected column=value, got {pair:?}");
        };
        let col = col.trim();
        validate_ident(col)?;
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
            _ => Value::String(raw.to_string()),
        };
        out.insert(col.to_string(), value);
    }
    Ok(out)
}

pub async fn rewrite(cfg: RewriteConfig) -> Result<()> {
    env_util::init_env();
    let spec = cfg.detail.to_table()?;
    validate_ident(&cfg.dependent_table)?;
    validate_ident(&cfg.dependent_id_column)?;
    let patch = parse_assignments(&cfg.set)?;
    if patch.is_empty() {
        bail!("nothing to update; pass at least one --set column=value");
    }
    let template = parse_assignments(&cfg.detail_values)?;
    let store = connect_store(&cfg.store).await?;
    let update = DependentUpdate {
        table: &cfg.dependent_table,
        id_column: &cfg.dependent_id_column,
        id: &cfg.id,
        patch: &patch,
    };
    let outcome = rewrite_dependent(store.as_ref(), &update, &spec, &template, &RetryPolicy::from_env())
        .await
        .with_context(|| format!("rewriting {} {}", cfg.dependent_table, cfg.id))?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}
