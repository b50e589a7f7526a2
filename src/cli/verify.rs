use anyhow::{Context, Result};

use super::{connect_store, EntityArgs, StoreConfig};
use crate::config::parse_list;
use crate::normalization::Normalizer;
use crate::reconcile::verify::{verify, Residual};
use crate::util::env as env_util;
use crate::util::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct VerifyConfig {
    pub store: StoreConfig,
    pub entity: EntityArgs,
    pub strip_prefixes: Option<String>,
    pub json: bool,
}

pub fn render_residuals(residuals: &[Residual]) -> String {
    if residuals.is_empty() {
        return "residual duplicates: none\n".to_string();
    }
    let mut out = format!("residual duplicates ({}):\n", residuals.len());
    for r in residuals {
        out.push_str(&format!("  {} -> {}\n", r.key, r.ids.join(",")));
    }
    out
}

pub async fn run(cfg: VerifyConfig) -> Result<i32> {
    env_util::init_env();
    let normalizer = match cfg.strip_prefixes.as_deref() {
        Some(raw) => Normalizer::new(parse_list(raw)),
        None => Normalizer::default(),
    };
    let entity = cfg.entity.to_table()?;
    let store = connect_store(&cfg.store).await?;
    let residuals = verify(store.as_ref(), &entity, &normalizer, &RetryPolicy::from_env())
        .await
        .with_context(|| format!("verifying {}", entity.table))?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&residuals)?);
    } else {
        print!("{}", render_residuals(&residuals));
    }
    Ok(if residuals.is_empty() { 0 } else { 1 })
}
