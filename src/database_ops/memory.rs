//! In-process [`Store`](super::Store) for unit tests.
//!
//! Rows are JSON objects. The store can enforce unique columns, simulate the
//! database trigger that creates a Detail Record when its owner is updated,
//! and inject failures for specific count and delete calls.
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    parse_timestamp, value_to_text, DetailRecord, DetailTable, EntityTable, PrimaryEntity, Store,
    StoreError,
};

#[derive(Debug, Clone)]
struct DetailTrigger {
    owner_table: String,
    detail: DetailTable,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    triggers: Vec<DetailTrigger>,
    failing_counts: HashSet<(String, String)>,
    failing_deletes: HashSet<(String, String)>,
    writes: usize,
    next_id: u64,
    events: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct Table {
    columns: Vec<String>,
    unique: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn row_matches(row: &Map<String, Value>, column: &str, value: &str) -> bool {
    row.get(column).and_then(value_to_text).as_deref() == Some(value)
}

impl Inner {
    fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::Config(format!("table {name} does not exist")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::Config(format!("table {name} does not exist")))
    }

    fn check_unique(
        &self,
        table: &str,
        candidate: &Map<String, Value>,
        skip: Option<usize>,
    ) -> Result<(), StoreError> {
        let t = self.table(table)?;
        for col in &t.unique {
            let Some(v) = candidate.get(col).and_then(value_to_text) else {
                continue;
            };
            let clash = t
                .rows
                .iter()
                .enumerate()
                .any(|(i, r)| Some(i) != skip && row_matches(r, col, &v));
            if clash {
                return Err(StoreError::Constraint(format!(
                    "duplicate key value violates unique constraint {table}_{col}_key ({col})=({v})"
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, row: Map<String, Value>) -> Result<(), StoreError> {
        self.check_unique(table, &row, None)?;
        self.table_mut(table)?.rows.push(row);
        self.writes += 1;
        Ok(())
    }

    fn fire_triggers(&mut self, table: &str, owner_id: &str) -> Result<(), StoreError> {
        let fired: Vec<DetailTrigger> = self
            .triggers
            .iter()
            .filter(|t| t.owner_table == table)
            .cloned()
            .collect();
        for trig in fired {
            let exists = self
                .table(&trig.detail.table)?
                .rows
                .iter()
                .any(|r| row_matches(r, &trig.detail.owner_column, owner_id));
            if exists {
                continue;
            }
            self.next_id += 1;
            let mut row = Map::new();
            row.insert(
                trig.detail.id_column.clone(),
                Value::String(format!("auto-{}", self.next_id)),
            );
            row.insert(trig.detail.owner_column.clone(), Value::String(owner_id.to_string()));
            row.insert(
                trig.detail.created_column.clone(),
                Value::String(Utc::now().to_rfc3339()),
            );
            self.insert(&trig.detail.table, row)?;
            self.events
                .push(format!("trigger {} {owner_id}", trig.detail.table));
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Other("memory store mutex poisoned".into()))
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) -> &Self {
        if let Ok(mut g) = self.lock() {
            g.tables.insert(
                name.to_string(),
                Table {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    ..Table::default()
                },
            );
        }
        self
    }

    pub fn add_unique(&self, table: &str, column: &str) -> &Self {
        if let Ok(mut g) = self.lock() {
            if let Some(t) = g.tables.get_mut(table) {
                t.unique.push(column.to_string());
            }
        }
        self
    }

    /// Seed a row without counting it as a write.
    pub fn seed(&self, table: &str, row: Value) -> &Self {
        if let (Ok(mut g), Value::Object(map)) = (self.lock(), row) {
            if let Some(t) = g.tables.get_mut(table) {
                t.rows.push(map);
            }
        }
        self
    }

    /// Updating a row of `owner_table` creates a detail row when none exists.
    pub fn add_detail_trigger(&self, owner_table: &str, detail: &DetailTable) -> &Self {
        if let Ok(mut g) = self.lock() {
            g.triggers.push(DetailTrigger {
                owner_table: owner_table.to_string(),
                detail: detail.clone(),
            });
        }
        self
    }

    pub fn fail_count(&self, table: &str, value: &str) -> &Self {
        if let Ok(mut g) = self.lock() {
            g.failing_counts.insert((table.to_string(), value.to_string()));
        }
        self
    }

    pub fn fail_delete(&self, table: &str, id: &str) -> &Self {
        if let Ok(mut g) = self.lock() {
            g.failing_deletes.insert((table.to_string(), id.to_string()));
        }
        self
    }

    pub fn rows(&self, table: &str) -> Vec<Map<String, Value>> {
        self.lock()
            .ok()
            .and_then(|g| g.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    /// Mutating calls that changed at least one row.
    pub fn writes(&self) -> usize {
        self.lock().map(|g| g.writes).unwrap_or(0)
    }

    /// Ordered log of repoints, deletes and trigger firings.
    pub fn events(&self) -> Vec<String> {
        self.lock().map(|g| g.events.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn check_columns(&self, table: &str, columns: &[&str]) -> Result<(), StoreError> {
        let g = self.lock()?;
        let t = g.table(table)?;
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !t.columns.iter().any(|k| k.as_str() == *c))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Config(format!(
                "table {table} has no column(s) {missing:?}"
            )))
        }
    }

    async fn fetch_entities(&self, spec: &EntityTable) -> Result<Vec<PrimaryEntity>, StoreError> {
        let g = self.lock()?;
        let t = g.table(&spec.table)?;
        Ok(t.rows
            .iter()
            .filter_map(|r| {
                Some(PrimaryEntity {
                    id: r.get(&spec.id_column).and_then(value_to_text)?,
                    name: r
                        .get(&spec.name_column)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    created_at: spec
                        .created_column
                        .as_deref()
                        .and_then(|c| r.get(c))
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp),
                })
            })
            .collect())
    }

    async fn count_refs(&self, table: &str, column: &str, value: &str) -> Result<u64, StoreError> {
        let g = self.lock()?;
        if g.failing_counts.contains(&(table.to_string(), value.to_string())) {
            return Err(StoreError::Transient(format!(
                "simulated network error counting {table}.{column}={value}"
            )));
        }
        let t = g.table(table)?;
        Ok(t.rows.iter().filter(|r| row_matches(r, column, value)).count() as u64)
    }

    async fn repoint(
        &self,
        table: &str,
        column: &str,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError> {
        let mut g = self.lock()?;
        let t = g.table_mut(table)?;
        let mut n = 0u64;
        for row in t.rows.iter_mut().filter(|r| row_matches(r, column, from)) {
            row.insert(column.to_string(), Value::String(to.to_string()));
            n += 1;
        }
        if n > 0 {
            g.writes += 1;
        }
        g.events.push(format!("repoint {table} {from}->{to}"));
        Ok(n)
    }

    async fn delete_ids(
        &self,
        table: &str,
        id_column: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        let mut g = self.lock()?;
        for id in ids {
            if g.failing_deletes.contains(&(table.to_string(), id.clone())) {
                return Err(StoreError::Constraint(format!(
                    "update or delete on table {table} violates foreign key constraint ({id_column})=({id})"
                )));
            }
        }
        let t = g.table_mut(table)?;
        let before = t.rows.len();
        t.rows
            .retain(|r| !ids.iter().any(|id| row_matches(r, id_column, id)));
        let n = (before - t.rows.len()) as u64;
        if n > 0 {
            g.writes += 1;
        }
        for id in ids {
            g.events.push(format!("delete {table} {id}"));
        }
        Ok(n)
    }

    async fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StoreError> {
        let g = self.lock()?;
        let mut values: Vec<String> = g
            .table(table)?
            .rows
            .iter()
            .filter_map(|r| r.get(column).and_then(value_to_text))
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn fetch_details(&self, spec: &DetailTable) -> Result<Vec<DetailRecord>, StoreError> {
        let g = self.lock()?;
        Ok(g.table(&spec.table)?
            .rows
            .iter()
            .filter_map(|r| {
                Some(DetailRecord {
                    id: r.get(&spec.id_column).and_then(value_to_text)?,
                    owner_id: r.get(&spec.owner_column).and_then(value_to_text)?,
                    created_at: r
                        .get(&spec.created_column)
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp),
                })
            })
            .collect())
    }

    async fn delete_where(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<u64, StoreError> {
        self.delete_ids(table, column, &[value.to_string()]).await
    }

    async fn update_by_id(
        &self,
        table: &str,
        id_column: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let mut g = self.lock()?;
        let positions: Vec<usize> = g
            .table(table)?
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| row_matches(r, id_column, id))
            .map(|(i, _)| i)
            .collect();
        for &i in &positions {
            let mut updated = g.table(table)?.rows[i].clone();
            for (k, v) in patch {
                updated.insert(k.clone(), v.clone());
            }
            g.check_unique(table, &updated, Some(i))?;
            g.table_mut(table)?.rows[i] = updated;
        }
        if positions.is_empty() {
            return Ok(0);
        }
        g.writes += 1;
        g.fire_triggers(table, id)?;
        Ok(positions.len() as u64)
    }

    async fn insert_row(&self, table: &str, row: &Map<String, Value>) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        g.insert(table, row.clone())?;
        g.events.push(format!("insert {table}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail_table() -> DetailTable {
        DetailTable {
            table: "institutions".into(),
            id_column: "id".into(),
            owner_column: "holding_id".into(),
            created_column: "created_at".into(),
        }
    }

    #[tokio::test]
    async fn unique_constraint_rejects_second_detail() {
        let store = MemoryStore::new();
        store
            .create_table("institutions", &["id", "holding_id", "created_at"])
            .add_unique("institutions", "holding_id")
            .seed("institutions", json!({"id": "i1", "holding_id": "h1"}));
        let mut row = Map::new();
        row.insert("id".into(), json!("i2"));
        row.insert("holding_id".into(), json!("h1"));
        let err = store.insert_row("institutions", &row).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn trigger_creates_detail_on_owner_update() {
        let store = MemoryStore::new();
        let detail = detail_table();
        store
            .create_table("holdings", &["id", "status"])
            .create_table("institutions", &["id", "holding_id", "created_at"])
            .add_unique("institutions", "holding_id")
            .add_detail_trigger("holdings", &detail)
            .seed("holdings", json!({"id": "h1", "status": "draft"}));
        let mut patch = Map::new();
        patch.insert("status".into(), json!("verified"));
        let n = store.update_by_id("holdings", "id", "h1", &patch).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.rows("institutions").len(), 1);
        assert_eq!(store.count_refs("institutions", "holding_id", "h1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn numeric_ids_compare_as_text() {
        let store = MemoryStore::new();
        store
            .create_table("projects", &["id", "region_id"])
            .seed("projects", json!({"id": 1, "region_id": 7}))
            .seed("projects", json!({"id": 2, "region_id": "7"}));
        assert_eq!(store.count_refs("projects", "region_id", "7").await.unwrap(), 2);
        assert_eq!(store.repoint("projects", "region_id", "7", "9").await.unwrap(), 2);
        assert_eq!(store.count_refs("projects", "region_id", "9").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_column_is_config_error() {
        let store = MemoryStore::new();
        store.create_table("regions", &["id", "name"]);
        assert!(store.check_columns("regions", &["id", "name"]).await.is_ok());
        assert!(matches!(
            store.check_columns("regions", &["nama"]).await,
            Err(StoreError::Config(_))
        ));
        assert!(matches!(
            store.check_columns("provinces", &["id"]).await,
            Err(StoreError::Config(_))
        ));
    }
}
