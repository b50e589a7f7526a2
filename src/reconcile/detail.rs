//! Detail Record cleanup: a child table that should hold at most one row per
//! owning Dependent Record (unique on the owner column), but accumulated
//! several because an update trigger and an explicit upsert both created one.
use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::database_ops::{DetailRecord, DetailTable, Store, StoreError};
use crate::util::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailDuplicate {
    pub owner_id: String,
    pub keep: DetailRecord,
    pub stale: Vec<DetailRecord>,
}

/// Owners with more than one detail row, in first-seen order. The newest row
/// survives: latest `created_at` (missing is oldest), then the greatest id.
pub fn find_duplicate_details(records: Vec<DetailRecord>) -> Vec<DetailDuplicate> {
    let mut by_owner: IndexMap<String, Vec<DetailRecord>> = IndexMap::new();
    for r in records {
        by_owner.entry(r.owner_id.clone()).or_default().push(r);
    }
    by_owner
        .into_iter()
        .filter(|(_, rows)| rows.len() > 1)
        .filter_map(|(owner_id, rows)| {
            let keep_pos = rows
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|(pos, _)| pos)?;
            let mut stale = rows;
            let keep = stale.remove(keep_pos);
            Some(DetailDuplicate {
                owner_id,
                keep,
                stale,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailReport {
    pub table: String,
    pub dry_run: bool,
    pub records_scanned: usize,
    pub duplicates: Vec<DetailDuplicate>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Owners that still have more than one detail row after the run.
    pub residual_owners: Vec<String>,
}

impl DetailReport {
    pub fn exit_code(&self) -> i32 {
        if self.residual_owners.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{}: {} detail rows, {} owners with duplicates{}\n",
            self.table,
            self.records_scanned,
            self.duplicates.len(),
            if self.dry_run { " (dry run)" } else { "" }
        );
        for d in &self.duplicates {
            let stale: Vec<&str> = d.stale.iter().map(|r| r.id.as_str()).collect();
            out.push_str(&format!(
                "  owner {} keep {} drop {}\n",
                d.owner_id,
                d.keep.id,
                stale.join(",")
            ));
        }
        for (id, err) in &self.failed {
            out.push_str(&format!("  FAILED delete {id}: {err}\n"));
        }
        if self.residual_owners.is_empty() {
            out.push_str("no owners with duplicate detail rows remain\n");
        } else {
            out.push_str(&format!(
                "owners still duplicated: {}\n",
                self.residual_owners.join(",")
            ));
        }
        out
    }
}

pub async fn dedupe_details(
    store: &dyn Store,
    spec: &DetailTable,
    dry_run: bool,
    retry: &RetryPolicy,
) -> Result<DetailReport, StoreError> {
    let records = with_retry(retry, "fetch_details", || store.fetch_details(spec)).await?;
    let mut report = DetailReport {
        table: spec.table.clone(),
        dry_run,
        records_scanned: records.len(),
        duplicates: find_duplicate_details(records),
        ..DetailReport::default()
    };
    if report.duplicates.is_empty() {
        info!(table = %spec.table, "no duplicate detail rows found");
        return Ok(report);
    }
    if dry_run {
        report.residual_owners = report.duplicates.iter().map(|d| d.owner_id.clone()).collect();
        return Ok(report);
    }

    for dup in &report.duplicates {
        for stale in &dup.stale {
            let one = std::slice::from_ref(&stale.id);
            match with_retry(retry, "delete", || store.delete_ids(&spec.table, &spec.id_column, one)).await {
                Ok(_) | Err(StoreError::NotFound(_)) => report.deleted.push(stale.id.clone()),
                Err(e) => {
                    warn!(table = %spec.table, owner = %dup.owner_id, id = %stale.id, error = %e, "stale detail delete failed");
                    report.failed.push((stale.id.clone(), e.to_string()));
                }
            }
        }
    }

    let after = with_retry(retry, "fetch_details", || store.fetch_details(spec)).await?;
    report.residual_owners = find_duplicate_details(after)
        .into_iter()
        .map(|d| d.owner_id)
        .collect();
    info!(
        table = %spec.table,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        residual = report.residual_owners.len(),
        "detail dedupe finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSource {
    Trigger,
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewriteOutcome {
    pub removed: u64,
    pub source: DetailSource,
}

/// The dependent row being rewritten and the patch applied to it.
#[derive(Debug, Clone)]
pub struct DependentUpdate<'a> {
    pub table: &'a str,
    pub id_column: &'a str,
    pub id: &'a str,
    pub patch: &'a Map<String, Value>,
}

/// Update a Dependent Record without ending up with two detail rows.
///
/// Order is fixed: drop existing detail rows for the owner, apply the update
/// (which may fire the creating trigger), then insert `template` only if no
/// detail row exists. A unique violation on that insert means the trigger won
/// the race and is treated as the trigger having created the row.
///
/// A failure after the delete leaves the owner without a detail row; the
/// error then says how many were removed. The underlying [`StoreError`] stays
/// reachable through `downcast_ref`.
pub async fn rewrite_dependent(
    store: &dyn Store,
    update: &DependentUpdate<'_>,
    detail: &DetailTable,
    template: &Map<String, Value>,
    retry: &RetryPolicy,
) -> anyhow::Result<RewriteOutcome> {
    let removed = with_retry(retry, "delete_details", || {
        store.delete_where(&detail.table, &detail.owner_column, update.id)
    })
    .await?;

    update_and_restore(store, update, detail, template, retry, removed)
        .await
        .map_err(|e| {
            let e = anyhow::Error::from(e);
            if removed == 0 {
                return e;
            }
            warn!(owner = %update.id, removed, "rewrite failed after detail rows were deleted");
            e.context(format!(
                "{removed} detail row(s) in {} for {} {} were already deleted; re-run to restore",
                detail.table, update.table, update.id
            ))
        })
}

async fn update_and_restore(
    store: &dyn Store,
    update: &DependentUpdate<'_>,
    detail: &DetailTable,
    template: &Map<String, Value>,
    retry: &RetryPolicy,
    removed: u64,
) -> Result<RewriteOutcome, StoreError> {
    let updated = with_retry(retry, "update_dependent", || {
        store.update_by_id(update.table, update.id_column, update.id, update.patch)
    })
    .await?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!(
            "{} {}={} does not exist",
            update.table, update.id_column, update.id
        )));
    }

    let present = with_retry(retry, "count_details", || {
        store.count_refs(&detail.table, &detail.owner_column, update.id)
    })
    .await?;
    if present > 0 {
        info!(owner = %update.id, removed, "detail row recreated by trigger");
        return Ok(RewriteOutcome {
            removed,
            source: DetailSource::Trigger,
        });
    }

    let mut row = template.clone();
    row.insert(
        detail.owner_column.clone(),
        Value::String(update.id.to_string()),
    );
    row.entry(detail.created_column.clone())
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    match with_retry(retry, "insert_detail", || store.insert_row(&detail.table, &row)).await {
        Ok(()) => {
            info!(owner = %update.id, removed, "detail row inserted");
            Ok(RewriteOutcome {
                removed,
                source: DetailSource::Insert,
            })
        }
        Err(StoreError::Constraint(msg)) => {
            warn!(owner = %update.id, error = %msg, "detail insert lost the race to the trigger");
            Ok(RewriteOutcome {
                removed,
                source: DetailSource::Trigger,
            })
        }
        Err(e) => Err(e),
    }
}
