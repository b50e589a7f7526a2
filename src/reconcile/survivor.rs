use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;

use super::refcount::RefCount;
use crate::database_ops::PrimaryEntity;

/// How the one surviving entity of a duplicate group is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SurvivorPolicy {
    /// Highest total reference count; ties -> earliest `created_at`, then fetch order.
    #[default]
    MostReferenced,
    /// Latest `created_at`; reference counts are not consulted.
    MostRecent,
}

impl SurvivorPolicy {
    pub fn needs_counts(self) -> bool {
        matches!(self, SurvivorPolicy::MostReferenced)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SurvivorPolicy::MostReferenced => "most-referenced",
            SurvivorPolicy::MostRecent => "most-recent",
        }
    }
}

impl std::fmt::Display for SurvivorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub keep: PrimaryEntity,
    pub losers: Vec<PrimaryEntity>,
}

impl Selection {
    pub fn loser_ids(&self) -> Vec<String> {
        self.losers.iter().map(|l| l.id.clone()).collect()
    }
}

// Missing timestamps sort after every real one in both directions.
fn earliest_first(ts: Option<DateTime<Utc>>) -> (bool, Option<DateTime<Utc>>) {
    (ts.is_none(), ts)
}

fn latest_first(ts: Option<DateTime<Utc>>) -> (bool, Reverse<Option<DateTime<Utc>>>) {
    (ts.is_none(), Reverse(ts))
}

/// Exactly one keep per group; `None` only for an empty group. Members that
/// have no entry in `counts` count as zero references.
pub fn select_survivor(
    policy: SurvivorPolicy,
    members: &[PrimaryEntity],
    counts: &[RefCount],
) -> Option<Selection> {
    let totals: HashMap<&str, u64> = counts.iter().map(|c| (c.id.as_str(), c.total)).collect();
    let total_of = |m: &PrimaryEntity| totals.get(m.id.as_str()).copied().unwrap_or(0);

    let keep_pos = match policy {
        SurvivorPolicy::MostReferenced => members
            .iter()
            .enumerate()
            .min_by_key(|(pos, m)| (Reverse(total_of(m)), earliest_first(m.created_at), *pos))
            .map(|(pos, _)| pos)?,
        SurvivorPolicy::MostRecent => members
            .iter()
            .enumerate()
            .min_by_key(|(pos, m)| (latest_first(m.created_at), *pos))
            .map(|(pos, _)| pos)?,
    };

    let keep = members[keep_pos].clone();
    let losers = members
        .iter()
        .enumerate()
        .filter(|(pos, _)| *pos != keep_pos)
        .map(|(_, m)| m.clone())
        .collect();
    Some(Selection { keep, losers })
}
