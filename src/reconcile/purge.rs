use serde::Serialize;
use tracing::{info, warn};

use crate::database_ops::{EntityTable, Store, StoreError};
use crate::util::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    pub deleted: Vec<String>,
    /// Ids that are already gone when the delete ran.
    pub already_absent: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PurgeOutcome {
    pub fn fully_cleaned(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete losers from the primary table one id at a time.
///
/// A failure leaves that id in place and moves on to the next one.
pub async fn purge_losers(
    store: &dyn Store,
    entity: &EntityTable,
    loser_ids: &[String],
    retry: &RetryPolicy,
) -> PurgeOutcome {
    let mut out = PurgeOutcome::default();
    for id in loser_ids {
        let one = std::slice::from_ref(id);
        let res = with_retry(retry, "delete", || {
            store.delete_ids(&entity.table, &entity.id_column, one)
        })
        .await;
        match res {
            Ok(0) | Err(StoreError::NotFound(_)) => out.already_absent.push(id.clone()),
            Ok(_) => {
                info!(table = %entity.table, id = %id, "deleted duplicate");
                out.deleted.push(id.clone());
            }
            Err(error) => {
                warn!(table = %entity.table, id = %id, kind = error.kind(), error = %error, "delete failed; row left in place");
                out.failed.push((id.clone(), error.to_string()));
            }
        }
    }
    out
}
