use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::{connect_store, resolve_dependents, EntityArgs, StoreConfig};
use crate::config::{parse_list, ReconcileConfig, DEFAULT_CONCURRENCY, DEFAULT_DEADLINE};
use crate::reconcile::report::{RunAborted, RunSummary};
use crate::reconcile::survivor::SurvivorPolicy;
use crate::reconcile::Reconciler;
use crate::util::env as env_util;
use crate::util::lock::RunLock;
use crate::util::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct DedupeConfig {
    pub store: StoreConfig,
    pub entity: EntityArgs,
    /// `table:fk_column,...`; falls back to RECONCILE_TABLES.
    pub tables: Option<String>,
    pub policy: SurvivorPolicy,
    pub dry_run: bool,
    /// Comma-separated qualifier tokens replacing the defaults.
    pub strip_prefixes: Option<String>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub max_consecutive_failures: Option<usize>,
    pub deadline: Option<Duration>,
    pub journal: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub no_lock: bool,
    pub json: bool,
}

pub fn reconcile_config(cfg: &DedupeConfig) -> Result<ReconcileConfig> {
    let entity = cfg.entity.to_table()?;
    let dependents = resolve_dependents(cfg.tables.as_deref())?;
    let mut rc = ReconcileConfig::new(entity, dependents);
    rc.policy = cfg.policy;
    rc.dry_run = cfg.dry_run || env_util::env_flag("DRY_RUN", false);
    rc.concurrency = cfg
        .concurrency
        .unwrap_or_else(|| env_util::env_parse("RECONCILE_CONCURRENCY", DEFAULT_CONCURRENCY))
        .max(1);
    rc.retry = RetryPolicy::from_env();
    if let Some(n) = cfg.max_attempts {
        rc.retry.max_attempts = n.max(1);
    }
    if let Some(t) = cfg.store.call_timeout {
        rc.retry.call_timeout = t;
    }
    if let Some(raw) = cfg.strip_prefixes.as_deref() {
        rc.qualifiers = parse_list(raw);
    }
    if let Some(n) = cfg.max_consecutive_failures {
        rc.max_consecutive_failures = n.max(1);
    }
    rc.journal = cfg.journal.clone();
    rc.lock_file = if cfg.no_lock {
        None
    } else {
        Some(
            cfg.lock_file
                .clone()
                .unwrap_or_else(|| RunLock::default_path(&rc.entity.table)),
        )
    };
    rc.validate()?;
    Ok(rc)
}

/// Returns the process exit code: 0 clean, 1 residual duplicates remain.
/// An aborted run still prints what it managed before returning the error.
pub async fn run(cfg: DedupeConfig) -> Result<i32> {
    env_util::init_env();
    let rc = reconcile_config(&cfg)?;
    env_util::preflight_check(
        "dedupe",
        &[],
        &[
            "SUPABASE_DB_URL",
            "DATABASE_URL",
            "SUPABASE_URL",
            "SUPABASE_SERVICE_ROLE_KEY",
            "RECONCILE_BACKEND",
            "RECONCILE_CONCURRENCY",
            "RECONCILE_MAX_ATTEMPTS",
            "RECONCILE_PAGE_SIZE",
            "DRY_RUN",
        ],
    )?;

    let store = connect_store(&cfg.store).await?;
    let deadline = cfg.deadline.unwrap_or(DEFAULT_DEADLINE);
    let reconciler = Reconciler::new(store.as_ref(), rc);
    let outcome = tokio::time::timeout(deadline, reconciler.run())
        .await
        .with_context(|| format!("run {} exceeded its {deadline:?} deadline", reconciler.run_id()))?;
    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(aborted) = e.downcast_ref::<RunAborted>() {
                print_summary(&aborted.partial, cfg.json)?;
            }
            return Err(e);
        }
    };

    print_summary(&summary, cfg.json)?;
    info!(run_id = %summary.run_id, exit_code = summary.exit_code(), "dedupe done");
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary.render());
    }
    Ok(())
}
