use indexmap::IndexMap;
use serde::Serialize;
use std::fmt::Write as _;

use super::refcount::RefCount;
use super::survivor::SurvivorPolicy;
use super::verify::Residual;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Reconciled,
    /// Plan computed, nothing written.
    DryRun,
    /// Nothing was written for this group.
    NotReconciled { reason: String },
    /// Repoint finished but at least one loser row is still present.
    NotFullyCleaned,
}

impl GroupStatus {
    pub fn label(&self) -> &'static str {
        match self {
            GroupStatus::Reconciled => "reconciled",
            GroupStatus::DryRun => "dry-run",
            GroupStatus::NotReconciled { .. } => "NOT RECONCILED",
            GroupStatus::NotFullyCleaned => "NOT FULLY CLEANED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub key: String,
    pub members: Vec<String>,
    pub keep_id: Option<String>,
    pub losers: Vec<String>,
    pub counts: Vec<RefCount>,
    pub repointed: IndexMap<String, u64>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    #[serde(flatten)]
    pub status: GroupStatus,
}

impl GroupReport {
    pub fn new(key: &str, members: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            members,
            keep_id: None,
            losers: Vec::new(),
            counts: Vec::new(),
            repointed: IndexMap::new(),
            deleted: Vec::new(),
            failed: Vec::new(),
            status: GroupStatus::DryRun,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub backend: String,
    pub table: String,
    pub policy: SurvivorPolicy,
    pub dry_run: bool,
    pub entities_scanned: usize,
    pub groups: Vec<GroupReport>,
    pub residuals: Vec<Residual>,
    /// Set when the run stopped before verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

/// Carries the groups handled before the run gave up, so they can still be
/// reported next to the error.
#[derive(Debug, thiserror::Error)]
#[error("aborting: {reason}")]
pub struct RunAborted {
    pub reason: String,
    pub partial: RunSummary,
}

impl RunSummary {
    /// 0 when no canonical key has more than one entity left, 2 when the run
    /// never reached verification.
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.residuals.is_empty() {
            0
        } else {
            1
        }
    }

    pub fn reconciled(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status == GroupStatus::Reconciled)
            .count()
    }

    /// Human-readable summary; residual duplicates always come last.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run {} on {} ({}), policy {}{}",
            self.run_id,
            self.table,
            self.backend,
            self.policy,
            if self.dry_run { ", DRY RUN" } else { "" }
        );
        let _ = writeln!(
            out,
            "scanned {} entities, {} duplicate groups, {} reconciled",
            self.entities_scanned,
            self.groups.len(),
            self.reconciled()
        );
        for g in &self.groups {
            let _ = writeln!(
                out,
                "- {} [{}] keep={} merge={}",
                g.key,
                g.status.label(),
                g.keep_id.as_deref().unwrap_or("-"),
                g.losers.join(",")
            );
            if let GroupStatus::NotReconciled { reason } = &g.status {
                let _ = writeln!(out, "    reason: {reason}");
            }
            for (table, n) in &g.repointed {
                let _ = writeln!(out, "    repointed {n} rows in {table}");
            }
            for (id, err) in &g.failed {
                let _ = writeln!(out, "    delete {id} failed: {err}");
            }
        }
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "run aborted before verification: {reason}");
        } else if self.residuals.is_empty() {
            let _ = writeln!(out, "residual duplicates: none");
        } else {
            let _ = writeln!(out, "residual duplicates ({}):", self.residuals.len());
            for r in &self.residuals {
                let _ = writeln!(out, "  {} -> {}", r.key, r.ids.join(","));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(residuals: Vec<Residual>) -> RunSummary {
        let mut g = GroupReport::new("SLEMAN", vec!["1".into(), "2".into()]);
        g.keep_id = Some("1".into());
        g.losers = vec!["2".into()];
        g.repointed.insert("projects".into(), 4);
        g.status = GroupStatus::Reconciled;
        RunSummary {
            run_id: "run-1".into(),
            backend: "memory".into(),
            table: "regions".into(),
            policy: SurvivorPolicy::MostReferenced,
            dry_run: false,
            entities_scanned: 3,
            groups: vec![g],
            residuals,
            aborted: None,
        }
    }

    #[test]
    fn exit_code_follows_residuals() {
        assert_eq!(summary(vec![]).exit_code(), 0);
        let r = Residual {
            key: "BANTUL".into(),
            ids: vec!["5".into(), "6".into()],
        };
        assert_eq!(summary(vec![r]).exit_code(), 1);
    }

    #[test]
    fn render_puts_residuals_last() {
        let r = Residual {
            key: "BANTUL".into(),
            ids: vec!["5".into(), "6".into()],
        };
        let text = summary(vec![r]).render();
        assert!(text.contains("- SLEMAN [reconciled] keep=1 merge=2"));
        assert!(text.contains("repointed 4 rows in projects"));
        let last = text.lines().last().unwrap();
        assert_eq!(last, "  BANTUL -> 5,6");
    }

    #[test]
    fn aborted_run_is_not_reported_clean() {
        let mut s = summary(vec![]);
        s.aborted = Some("3 groups in a row failed".into());
        assert_eq!(s.exit_code(), 2);
        let text = s.render();
        assert!(text.contains("- SLEMAN [reconciled]"));
        assert!(!text.contains("residual duplicates: none"));
        assert!(text.ends_with("run aborted before verification: 3 groups in a row failed\n"));
    }

    #[test]
    fn json_flattens_status() {
        let json = serde_json::to_value(summary(vec![])).unwrap();
        assert_eq!(json["groups"][0]["status"], "reconciled");
        assert_eq!(json["policy"], "most-referenced");
    }
}
