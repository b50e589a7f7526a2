use anyhow::{Context, Result};

use super::{connect_store, resolve_dependents, EntityArgs, StoreConfig};
use crate::reconcile::orphans::{find_orphans, OrphanReport};
use crate::util::env as env_util;
use crate::util::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct OrphansConfig {
    pub store: StoreConfig,
    pub entity: EntityArgs,
    pub tables: Option<String>,
    /// Cap on dangling values printed per table; 0 prints all.
    pub sample: usize,
    pub json: bool,
}

pub fn render(reports: &[OrphanReport], sample: usize) -> String {
    let mut out = String::new();
    for r in reports {
        out.push_str(&format!(
            "{}.{}: {} orphaned value(s)\n",
            r.table,
            r.fk_column,
            r.dangling.len()
        ));
        let shown = if sample == 0 { r.dangling.len() } else { sample };
        for v in r.dangling.iter().take(shown) {
            out.push_str(&format!("  {v}\n"));
        }
        if r.dangling.len() > shown {
            out.push_str(&format!("  ... {} more\n", r.dangling.len() - shown));
        }
    }
    out
}

/// Exit 1 when any dependent table references a missing primary entity.
pub async fn run(cfg: OrphansConfig) -> Result<i32> {
    env_util::init_env();
    let entity = cfg.entity.to_table()?;
    let dependents = resolve_dependents(cfg.tables.as_deref())?;
    let store = connect_store(&cfg.store).await?;
    let reports = find_orphans(store.as_ref(), &entity, &dependents, &RetryPolicy::from_env())
        .await
        .context("orphan audit failed")?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print!("{}", render(&reports, cfg.sample));
    }
    Ok(if reports.iter().all(|r| r.dangling.is_empty()) { 0 } else { 1 })
}
