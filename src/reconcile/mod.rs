//! Entity deduplication and reference reconciliation.
//!
//! One run: fetch primary entities, group them by canonical name, and for
//! every group with more than one member pick a survivor, move all dependent
//! references onto it and delete the rest. The final verification pass
//! regroups the table as it is after the run.
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

pub mod detail;
pub mod grouper;
pub mod journal;
pub mod orphans;
pub mod purge;
pub mod refcount;
pub mod repoint;
pub mod report;
pub mod survivor;
pub mod verify;

use crate::config::ReconcileConfig;
use crate::database_ops::{MergePlan, Store, StoreError};
use crate::normalization::Normalizer;
use crate::util::lock::RunLock;
use crate::util::retry::with_retry;
use grouper::{DuplicateGroup, Grouping};
use journal::{Journal, JournalEntry};
use report::{GroupReport, GroupStatus, RunAborted, RunSummary};
use survivor::select_survivor;
use verify::Residual;

pub fn new_run_id() -> String {
    format!(
        "{}-{:04x}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        rand::random::<u16>()
    )
}

pub struct Reconciler<'a> {
    store: &'a dyn Store,
    cfg: ReconcileConfig,
    normalizer: Normalizer,
    run_id: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn Store, cfg: ReconcileConfig) -> Self {
        let normalizer = cfg.normalizer();
        Self {
            store,
            cfg,
            normalizer,
            run_id: new_run_id(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Probe every configured table and column before anything is written.
    pub async fn preflight(&self) -> Result<(), StoreError> {
        self.cfg.validate()?;
        let entity = &self.cfg.entity;
        let cols = entity.columns();
        with_retry(&self.cfg.retry, "check_columns", || {
            self.store.check_columns(&entity.table, &cols)
        })
        .await?;
        for dep in &self.cfg.dependents {
            let cols = [dep.fk_column.as_str()];
            with_retry(&self.cfg.retry, "check_columns", || {
                self.store.check_columns(&dep.table, &cols)
            })
            .await?;
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let cfg = &self.cfg;
        info!(
            run_id = %self.run_id,
            backend = self.store.backend(),
            table = %cfg.entity.table,
            policy = %cfg.policy,
            dry_run = cfg.dry_run,
            dependents = cfg.dependents.len(),
            "reconcile run starting"
        );
        self.preflight().await.context("preflight failed")?;

        let _lock = match (&cfg.lock_file, cfg.dry_run) {
            (Some(path), false) => Some(RunLock::acquire(path)?),
            _ => None,
        };
        let mut journal = match (&cfg.journal, cfg.dry_run) {
            (Some(path), false) => Some(Journal::open(path)?),
            _ => None,
        };

        let entities = with_retry(&cfg.retry, "fetch_entities", || {
            self.store.fetch_entities(&cfg.entity)
        })
        .await
        .context("fetching primary entities")?;
        let scanned = entities.len();
        let grouping = Grouping::build(entities, &self.normalizer);
        let candidates = grouping.candidates();
        info!(
            scanned,
            named = grouping.entity_count(),
            keys = grouping.key_count(),
            groups = candidates.len(),
            qualifiers = ?self.normalizer.qualifiers(),
            "grouped entities"
        );
        if !grouping.unnamed().is_empty() {
            let ids: Vec<&str> = grouping.unnamed().iter().map(|e| e.id.as_str()).collect();
            warn!(count = ids.len(), ids = ?ids, "unnamed entities left out of grouping");
        }
        if candidates.is_empty() {
            info!("no duplicates found");
        }

        let mut groups = Vec::with_capacity(candidates.len());
        let mut consecutive_transient = 0usize;
        for group in &candidates {
            let (report, transient) = self.reconcile_group(group, journal.as_mut()).await?;
            groups.push(report);
            if !transient {
                consecutive_transient = 0;
                continue;
            }
            consecutive_transient += 1;
            if consecutive_transient >= cfg.max_consecutive_failures.max(1) {
                let reason = format!(
                    "{consecutive_transient} groups in a row failed with transient errors (last: {})",
                    group.key
                );
                let mut partial = self.summary(scanned, groups, Vec::new());
                partial.aborted = Some(reason.clone());
                return Err(RunAborted { reason, partial }.into());
            }
        }

        let residuals = verify::verify(self.store, &cfg.entity, &self.normalizer, &cfg.retry)
            .await
            .context("verification failed")?;

        let summary = self.summary(scanned, groups, residuals);
        info!(
            run_id = %self.run_id,
            groups = summary.groups.len(),
            reconciled = summary.reconciled(),
            residuals = summary.residuals.len(),
            "reconcile run finished"
        );
        Ok(summary)
    }

    fn summary(&self, scanned: usize, groups: Vec<GroupReport>, residuals: Vec<Residual>) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            backend: self.store.backend().to_string(),
            table: self.cfg.entity.table.clone(),
            policy: self.cfg.policy,
            dry_run: self.cfg.dry_run,
            entities_scanned: scanned,
            groups,
            residuals,
            aborted: None,
        }
    }

    /// Returns the group report and whether it failed on a transient error.
    async fn reconcile_group(
        &self,
        group: &DuplicateGroup,
        journal: Option<&mut Journal>,
    ) -> Result<(GroupReport, bool)> {
        let cfg = &self.cfg;
        let mut report = GroupReport::new(&group.key, group.ids());

        let counts = if cfg.policy.needs_counts() {
            match refcount::count_group(
                self.store,
                group,
                &cfg.dependents,
                &cfg.retry,
                cfg.concurrency,
            )
            .await
            {
                Ok(counts) => counts,
                Err(failure) => {
                    warn!(key = %group.key, error = %failure, "group skipped: reference counts incomplete");
                    report.status = GroupStatus::NotReconciled {
                        reason: failure.to_string(),
                    };
                    return Ok((report, failure.error.is_retryable()));
                }
            }
        } else {
            Vec::new()
        };

        let Some(selection) = select_survivor(cfg.policy, &group.members, &counts) else {
            report.status = GroupStatus::NotReconciled {
                reason: "empty group".into(),
            };
            return Ok((report, false));
        };
        report.keep_id = Some(selection.keep.id.clone());
        report.losers = selection.loser_ids();
        report.counts = counts;
        info!(
            key = %group.key,
            keep_id = %selection.keep.id,
            losers = ?report.losers,
            "survivor selected"
        );

        if cfg.dry_run {
            report.status = GroupStatus::DryRun;
            return Ok((report, false));
        }

        if let Some(j) = journal {
            j.append(&JournalEntry::new(
                &self.run_id,
                &group.key,
                &selection.keep.id,
                &selection.losers,
                &cfg.dependents,
            ))?;
        }

        let plan = MergePlan {
            key: group.key.clone(),
            keep_id: selection.keep.id.clone(),
            loser_ids: report.losers.clone(),
            entity: cfg.entity.clone(),
            dependents: cfg.dependents.clone(),
        };

        match with_retry(&cfg.retry, "merge", || self.store.merge_in_transaction(&plan)).await {
            Ok(Some(outcome)) => {
                report.repointed = outcome.repointed;
                report.deleted = outcome.deleted;
                report.failed = outcome.failed;
            }
            Ok(None) => {
                match repoint::repoint_group(
                    self.store,
                    &plan.keep_id,
                    &plan.loser_ids,
                    &plan.dependents,
                    &cfg.retry,
                )
                .await
                {
                    Ok(moved) => report.repointed = moved,
                    Err(failure) => {
                        warn!(key = %group.key, error = %failure, "group left unpurged: repoint incomplete");
                        report.status = GroupStatus::NotReconciled {
                            reason: failure.to_string(),
                        };
                        return Ok((report, failure.error.is_retryable()));
                    }
                }
                let purged =
                    purge::purge_losers(self.store, &cfg.entity, &plan.loser_ids, &cfg.retry).await;
                if !purged.fully_cleaned() {
                    warn!(key = %group.key, failed = purged.failed.len(), "losers left in place");
                }
                report.deleted = purged.deleted;
                report.deleted.extend(purged.already_absent);
                report.failed = purged.failed;
            }
            Err(e) => {
                warn!(key = %group.key, error = %e, "merge transaction rolled back");
                report.status = GroupStatus::NotReconciled {
                    reason: e.to_string(),
                };
                return Ok((report, e.is_retryable()));
            }
        }

        report.status = if report.failed.is_empty() {
            GroupStatus::Reconciled
        } else {
            GroupStatus::NotFullyCleaned
        };
        info!(
            key = %group.key,
            keep_id = %plan.keep_id,
            repointed = ?report.repointed,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "group merged"
        );
        Ok((report, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::{DependentRef, EntityTable};
    use crate::reconcile::survivor::SurvivorPolicy;
    use crate::util::retry::RetryPolicy;
    use serde_json::json;

    fn entity() -> EntityTable {
        EntityTable {
            table: "regions".into(),
            id_column: "id".into(),
            name_column: "name".into(),
            created_column: Some("created_at".into()),
        }
    }

    fn config() -> ReconcileConfig {
        let mut cfg = ReconcileConfig::new(
            entity(),
            vec![
                DependentRef::new("projects", "region_id"),
                DependentRef::new("holdings", "region_id"),
            ],
        );
        cfg.retry = RetryPolicy::immediate(2);
        cfg
    }

    /// Three spellings of one region; r2 carries five references, r1 two.
    fn scenario_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table("regions", &["id", "name", "created_at"])
            .create_table("projects", &["id", "region_id"])
            .create_table("holdings", &["id", "region_id"])
            .seed("regions", json!({"id": "r1", "name": "Foo Region", "created_at": "2024-01-01T00:00:00Z"}))
            .seed("regions", json!({"id": "r2", "name": "FOO REGION", "created_at": "2024-02-01T00:00:00Z"}))
            .seed("regions", json!({"id": "r3", "name": "foo region", "created_at": "2024-03-01T00:00:00Z"}))
            .seed("regions", json!({"id": "r4", "name": "Bantul", "created_at": "2024-01-01T00:00:00Z"}))
            .seed("projects", json!({"id": "p1", "region_id": "r1"}))
            .seed("projects", json!({"id": "p2", "region_id": "r2"}))
            .seed("projects", json!({"id": "p3", "region_id": "r2"}))
            .seed("projects", json!({"id": "p4", "region_id": "r4"}))
            .seed("holdings", json!({"id": "h1", "region_id": "r1"}))
            .seed("holdings", json!({"id": "h2", "region_id": "r2"}))
            .seed("holdings", json!({"id": "h3", "region_id": "r2"}))
            .seed("holdings", json!({"id": "h4", "region_id": "r2"}));
        store
    }

    fn region_ids(store: &MemoryStore) -> Vec<String> {
        store
            .rows("regions")
            .iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn most_referenced_survives_and_takes_all_references() {
        let store = scenario_store();
        let summary = Reconciler::new(&store, config()).run().await.unwrap();

        assert_eq!(summary.groups.len(), 1);
        let g = &summary.groups[0];
        assert_eq!(g.keep_id.as_deref(), Some("r2"));
        assert_eq!(g.losers, vec!["r1", "r3"]);
        assert_eq!(g.status, GroupStatus::Reconciled);
        let r2 = g.counts.iter().find(|c| c.id == "r2").unwrap();
        assert_eq!(r2.total, 5);

        assert_eq!(region_ids(&store), vec!["r2", "r4"]);
        assert_eq!(store.count_refs("projects", "region_id", "r2").await.unwrap(), 3);
        assert_eq!(store.count_refs("holdings", "region_id", "r2").await.unwrap(), 4);
        assert_eq!(store.count_refs("projects", "region_id", "r1").await.unwrap(), 0);
        assert!(summary.residuals.is_empty());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn every_repoint_precedes_the_first_delete() {
        let store = scenario_store();
        Reconciler::new(&store, config()).run().await.unwrap();
        let events = store.events();
        let first_delete = events.iter().position(|e| e.starts_with("delete")).unwrap();
        let last_repoint = events.iter().rposition(|e| e.starts_with("repoint")).unwrap();
        assert!(last_repoint < first_delete, "{events:?}");
    }

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let store = scenario_store();
        Reconciler::new(&store, config()).run().await.unwrap();
        let writes = store.writes();
        let again = Reconciler::new(&store, config()).run().await.unwrap();
        assert!(again.groups.is_empty());
        assert_eq!(again.exit_code(), 0);
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn count_failure_leaves_group_untouched() {
        let store = scenario_store();
        store.fail_count("holdings", "r3");
        let summary = Reconciler::new(&store, config()).run().await.unwrap();

        let g = &summary.groups[0];
        assert!(matches!(g.status, GroupStatus::NotReconciled { .. }));
        assert!(g.keep_id.is_none());
        assert_eq!(store.writes(), 0);
        assert_eq!(region_ids(&store).len(), 4);
        assert_eq!(summary.residuals.len(), 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing_or_locking() {
        let store = scenario_store();
        let lock = std::env::temp_dir().join(format!("forest-admin-dry-{}.lock", std::process::id()));
        let mut cfg = config();
        cfg.dry_run = true;
        cfg.lock_file = Some(lock.clone());
        let summary = Reconciler::new(&store, cfg).run().await.unwrap();

        assert_eq!(summary.groups[0].status, GroupStatus::DryRun);
        assert_eq!(summary.groups[0].keep_id.as_deref(), Some("r2"));
        assert_eq!(store.writes(), 0);
        assert!(!lock.exists());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn rejected_delete_marks_group_not_fully_cleaned() {
        let store = scenario_store();
        store.fail_delete("regions", "r3");
        let summary = Reconciler::new(&store, config()).run().await.unwrap();

        let g = &summary.groups[0];
        assert_eq!(g.status, GroupStatus::NotFullyCleaned);
        assert_eq!(g.deleted, vec!["r1"]);
        assert_eq!(g.failed[0].0, "r3");
        assert_eq!(region_ids(&store), vec!["r2", "r3", "r4"]);
        assert_eq!(store.count_refs("holdings", "region_id", "r2").await.unwrap(), 4);
        assert_eq!(summary.residuals[0].ids, vec!["r2", "r3"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn unknown_column_fails_before_any_write() {
        let store = scenario_store();
        let mut cfg = config();
        cfg.entity.name_column = "nama".into();
        let err = Reconciler::new(&store, cfg).run().await.unwrap_err();
        assert!(err.to_string().contains("preflight"));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn most_recent_policy_skips_counting() {
        let store = scenario_store();
        store.fail_count("holdings", "r2");
        let mut cfg = config();
        cfg.policy = SurvivorPolicy::MostRecent;
        let summary = Reconciler::new(&store, cfg).run().await.unwrap();

        let g = &summary.groups[0];
        assert_eq!(g.keep_id.as_deref(), Some("r3"));
        assert_eq!(g.status, GroupStatus::Reconciled);
        assert_eq!(store.count_refs("projects", "region_id", "r3").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn aborts_after_consecutive_transient_failures() {
        let store = scenario_store();
        store
            .seed("regions", json!({"id": "r5", "name": "BANTUL"}))
            .fail_count("projects", "r1")
            .fail_count("projects", "r4");
        let mut cfg = config();
        cfg.max_consecutive_failures = 2;
        let err = Reconciler::new(&store, cfg).run().await.unwrap_err();
        assert!(err.to_string().contains("in a row"));
        assert_eq!(store.writes(), 0);
        let aborted = err.downcast_ref::<RunAborted>().unwrap();
        assert_eq!(aborted.partial.groups.len(), 2);
        assert_eq!(aborted.partial.exit_code(), 2);
    }

    #[tokio::test]
    async fn abort_keeps_reports_of_groups_already_merged() {
        let store = scenario_store();
        store
            .seed("regions", json!({"id": "r5", "name": "BANTUL"}))
            .seed("regions", json!({"id": "r6", "name": "Kulon Progo"}))
            .seed("regions", json!({"id": "r7", "name": "KULON PROGO"}))
            .fail_count("projects", "r4")
            .fail_count("projects", "r6");
        let mut cfg = config();
        cfg.max_consecutive_failures = 2;
        let err = Reconciler::new(&store, cfg).run().await.unwrap_err();

        let partial = &err.downcast_ref::<RunAborted>().unwrap().partial;
        assert_eq!(partial.groups.len(), 3);
        assert_eq!(partial.groups[0].status, GroupStatus::Reconciled);
        assert_eq!(partial.groups[0].keep_id.as_deref(), Some("r2"));
        assert!(partial.render().contains("- FOO REGION [reconciled] keep=r2"));
    }

    #[tokio::test]
    async fn unnamed_entities_are_never_merged() {
        let store = MemoryStore::new();
        store
            .create_table("regions", &["id", "name", "created_at"])
            .create_table("projects", &["id", "region_id"])
            .create_table("holdings", &["id", "region_id"])
            .seed("regions", json!({"id": "r1", "name": null}))
            .seed("regions", json!({"id": "r2", "name": "  "}))
            .seed("regions", json!({"id": "r3", "name": ""}))
            .seed("projects", json!({"id": "p1", "region_id": "r1"}))
            .seed("projects", json!({"id": "p2", "region_id": "r2"}))
            .seed("projects", json!({"id": "p3", "region_id": "r3"}));
        let summary = Reconciler::new(&store, config()).run().await.unwrap();

        assert!(summary.groups.is_empty());
        assert!(summary.residuals.is_empty());
        assert_eq!(region_ids(&store), vec!["r1", "r2", "r3"]);
        assert_eq!(store.count_refs("projects", "region_id", "r2").await.unwrap(), 1);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn held_lock_stops_a_second_writer() {
        let store = scenario_store();
        let path = std::env::temp_dir().join(format!("forest-admin-held-{}.lock", std::process::id()));
        let _held = RunLock::acquire(&path).unwrap();
        let mut cfg = config();
        cfg.lock_file = Some(path.clone());
        assert!(Reconciler::new(&store, cfg).run().await.is_err());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn journal_records_each_merged_group() {
        let store = scenario_store();
        let path = std::env::temp_dir().join(format!("forest-admin-run-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut cfg = config();
        cfg.journal = Some(path.clone());
        let reconciler = Reconciler::new(&store, cfg);
        reconciler.run().await.unwrap();

        let entries = Journal::read_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].run_id, reconciler.run_id());
        assert_eq!(entries[0].keep_id, "r2");
        assert_eq!(entries[0].losers.len(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
