use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::database_ops::{DependentRef, EntityTable, Store, StoreError};
use crate::util::retry::{with_retry, RetryPolicy};

/// Foreign-key values in one dependent table that match no primary entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub table: String,
    pub fk_column: String,
    pub dangling: Vec<String>,
}

pub async fn find_orphans(
    store: &dyn Store,
    entity: &EntityTable,
    dependents: &[DependentRef],
    retry: &RetryPolicy,
) -> Result<Vec<OrphanReport>, StoreError> {
    let ids: HashSet<String> = with_retry(retry, "fetch_entities", || store.fetch_entities(entity))
        .await?
        .into_iter()
        .map(|e| e.id)
        .collect();

    let mut out = Vec::with_capacity(dependents.len());
    for dep in dependents {
        let values = with_retry(retry, "distinct_values", || {
            store.distinct_values(&dep.table, &dep.fk_column)
        })
        .await?;
        let dangling: Vec<String> = values.into_iter().filter(|v| !ids.contains(v)).collect();
        if dangling.is_empty() {
            info!(table = %dep.table, column = %dep.fk_column, "no orphaned references");
        } else {
            warn!(table = %dep.table, column = %dep.fk_column, count = dangling.len(), "orphaned references");
        }
        out.push(OrphanReport {
            table: dep.table.clone(),
            fk_column: dep.fk_column.clone(),
            dangling,
        });
    }
    Ok(out)
}
