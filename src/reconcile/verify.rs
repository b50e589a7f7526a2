use serde::Serialize;
use tracing::{info, warn};

use super::grouper::Grouping;
use crate::database_ops::{EntityTable, Store, StoreError};
use crate::normalization::Normalizer;
use crate::util::retry::{with_retry, RetryPolicy};

/// A canonical key that still has more than one entity after the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Residual {
    pub key: String,
    pub ids: Vec<String>,
}

pub fn residuals(grouping: &Grouping) -> Vec<Residual> {
    grouping
        .candidates()
        .into_iter()
        .map(|g| Residual {
            ids: g.ids(),
            key: g.key,
        })
        .collect()
}

/// Re-read the primary table and regroup it from scratch.
pub async fn verify(
    store: &dyn Store,
    entity: &EntityTable,
    normalizer: &Normalizer,
    retry: &RetryPolicy,
) -> Result<Vec<Residual>, StoreError> {
    let entities = with_retry(retry, "fetch_entities", || store.fetch_entities(entity)).await?;
    let scanned = entities.len();
    let grouping = Grouping::build(entities, normalizer);
    if !grouping.unnamed().is_empty() {
        let ids: Vec<&str> = grouping.unnamed().iter().map(|e| e.id.as_str()).collect();
        warn!(table = %entity.table, count = ids.len(), ids = ?ids, "unnamed entities skipped");
    }
    let found = residuals(&grouping);
    if found.is_empty() {
        info!(table = %entity.table, scanned, "verification clean");
    } else {
        for r in &found {
            warn!(key = %r.key, ids = ?r.ids, "residual duplicate");
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use serde_json::json;

    fn entity() -> EntityTable {
        EntityTable {
            table: "regions".into(),
            id_column: "id".into(),
            name_column: "name".into(),
            created_column: None,
        }
    }

    #[tokio::test]
    async fn reports_every_key_with_more_than_one_member() {
        let store = MemoryStore::new();
        store
            .create_table("regions", &["id", "name"])
            .seed("regions", json!({"id": "1", "name": "Sleman"}))
            .seed("regions", json!({"id": "2", "name": "KAB. SLEMAN"}))
            .seed("regions", json!({"id": "3", "name": "Bantul"}));
        let found = verify(&store, &entity(), &Normalizer::default(), &RetryPolicy::immediate(1))
            .await
            .unwrap();
        assert_eq!(
            found,
            vec![Residual {
                key: "SLEMAN".into(),
                ids: vec!["1".into(), "2".into()],
            }]
        );
    }

    #[tokio::test]
    async fn blank_names_are_not_residuals() {
        let store = MemoryStore::new();
        store
            .create_table("regions", &["id", "name"])
            .seed("regions", json!({"id": "1", "name": null}))
            .seed("regions", json!({"id": "2", "name": "  "}))
            .seed("regions", json!({"id": "3", "name": ""}));
        let found = verify(&store, &entity(), &Normalizer::default(), &RetryPolicy::immediate(1))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let store = MemoryStore::new();
        let err = verify(&store, &entity(), &Normalizer::default(), &RetryPolicy::immediate(1))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
