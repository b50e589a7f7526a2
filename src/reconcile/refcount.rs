use futures::{stream, StreamExt};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use super::grouper::DuplicateGroup;
use crate::database_ops::{DependentRef, Store, StoreError};
use crate::util::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefCount {
    pub id: String,
    pub total: u64,
    pub per_table: IndexMap<String, u64>,
}

/// First count query that still failed after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountFailure {
    pub id: String,
    pub table: String,
    pub error: StoreError,
}

impl std::fmt::Display for CountFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "count of {} for id {} failed: {}", self.table, self.id, self.error)
    }
}

/// N ids x M dependent tables count queries, at most `concurrency` in flight.
///
/// Any failed pair fails the whole group: a partial sum could pick a
/// less-referenced survivor.
pub async fn count_group(
    store: &dyn Store,
    group: &DuplicateGroup,
    dependents: &[DependentRef],
    retry: &RetryPolicy,
    concurrency: usize,
) -> Result<Vec<RefCount>, CountFailure> {
    let jobs: Vec<(usize, &str, &DependentRef)> = group
        .members
        .iter()
        .enumerate()
        .flat_map(|(pos, m)| dependents.iter().map(move |d| (pos, m.id.as_str(), d)))
        .collect();

    let results: Vec<_> = stream::iter(jobs)
        .map(|(pos, id, dep)| async move {
            let res = with_retry(retry, "count_refs", || {
                store.count_refs(&dep.table, &dep.fk_column, id)
            })
            .await;
            (pos, id, dep, res)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut counts: Vec<RefCount> = group
        .members
        .iter()
        .map(|m| RefCount {
            id: m.id.clone(),
            total: 0,
            per_table: dependents.iter().map(|d| (d.table.clone(), 0)).collect(),
        })
        .collect();
    let mut first_failure: Option<CountFailure> = None;

    for (pos, id, dep, res) in results {
        match res {
            Ok(n) => {
                let rc = &mut counts[pos];
                *rc.per_table.entry(dep.table.clone()).or_insert(0) += n;
                rc.total += n;
            }
            Err(error) => {
                warn!(key = %group.key, id, table = %dep.table, error = %error, "reference count failed");
                if first_failure.is_none() {
                    first_failure = Some(CountFailure {
                        id: id.to_string(),
                        table: dep.table.clone(),
                        error,
                    });
                }
            }
        }
    }

    if let Some(failure) = first_failure {
        return Err(failure);
    }
    for rc in &counts {
        debug!(key = %group.key, id = %rc.id, total = rc.total, "reference count");
    }
    Ok(counts)
}
