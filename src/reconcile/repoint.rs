use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::database_ops::{DependentRef, StoreError, Store};
use crate::util::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepointFailure {
    pub table: String,
    pub loser_id: String,
    pub error: StoreError,
}

impl std::fmt::Display for RepointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "repoint of {} from {} failed: {}",
            self.table, self.loser_id, self.error
        )
    }
}

/// Move every dependent row from each loser to `keep_id`, table by table.
///
/// Stops at the first failure so the caller never purges a group whose
/// repoint is incomplete. Returns rows moved per table in dependent order.
pub async fn repoint_group(
    store: &dyn Store,
    keep_id: &str,
    loser_ids: &[String],
    dependents: &[DependentRef],
    retry: &RetryPolicy,
) -> Result<IndexMap<String, u64>, RepointFailure> {
    let mut moved: IndexMap<String, u64> = IndexMap::new();
    for dep in dependents {
        let slot = moved.entry(dep.table.clone()).or_insert(0);
        for loser in loser_ids {
            let res = with_retry(retry, "repoint", || {
                store.repoint(&dep.table, &dep.fk_column, loser, keep_id)
            })
            .await;
            match res {
                Ok(n) => {
                    debug!(table = %dep.table, from = %loser, to = %keep_id, rows = n, "repointed");
                    *slot += n;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(error) => {
                    warn!(table = %dep.table, loser = %loser, error = %error, "repoint failed");
                    return Err(RepointFailure {
                        table: dep.table.clone(),
                        loser_id: loser.clone(),
                        error,
                    });
                }
            }
        }
    }
    Ok(moved)
}
