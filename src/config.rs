//! Run configuration. Everything the reconciler needs arrives through
//! [`ReconcileConfig`]; nothing below this layer reads the environment.
use std::path::PathBuf;
use std::time::Duration;

use crate::database_ops::{validate_ident, DependentRef, EntityTable, StoreError};
use crate::normalization::region::DEFAULT_QUALIFIERS;
use crate::normalization::Normalizer;
use crate::reconcile::survivor::SurvivorPolicy;
use crate::util::retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub entity: EntityTable,
    pub dependents: Vec<DependentRef>,
    pub policy: SurvivorPolicy,
    pub dry_run: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub qualifiers: Vec<String>,
    pub journal: Option<PathBuf>,
    /// `None` disables locking; dry runs never lock.
    pub lock_file: Option<PathBuf>,
    pub max_consecutive_failures: usize,
}

impl ReconcileConfig {
    pub fn new(entity: EntityTable, dependents: Vec<DependentRef>) -> Self {
        Self {
            entity,
            dependents,
            policy: SurvivorPolicy::default(),
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            qualifiers: DEFAULT_QUALIFIERS.iter().map(|q| q.to_string()).collect(),
            journal: None,
            lock_file: None,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(&self.qualifiers)
    }

    /// Identifier and shape checks that need no round trip.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_ident(&self.entity.table)?;
        for col in self.entity.columns() {
            validate_ident(col)?;
        }
        if self.dependents.is_empty() {
            return Err(StoreError::Config(
                "at least one dependent table:fk_column is required".into(),
            ));
        }
        for dep in &self.dependents {
            validate_ident(&dep.table)?;
            validate_ident(&dep.fk_column)?;
        }
        if self.concurrency == 0 {
            return Err(StoreError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// `projects:region_id,holdings:region_id`
pub fn parse_dependents(raw: &str) -> Result<Vec<DependentRef>, StoreError> {
    let mut out: Vec<DependentRef> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (table, column) = part.split_once(':').ok_or_else(|| {
            StoreError::Config(format!("expected table:fk_column, got {part:?}"))
        })?;
        let dep = DependentRef::new(table.trim(), column.trim());
        validate_ident(&dep.table)?;
        validate_ident(&dep.fk_column)?;
        if !out.contains(&dep) {
            out.push(dep);
        }
    }
    Ok(out)
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
