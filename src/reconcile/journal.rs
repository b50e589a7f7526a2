use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::database_ops::{DependentRef, PrimaryEntity};

/// One line per group, written before the group's first write so an
/// interrupted run leaves a record of what it was about to merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: String,
    pub at: DateTime<Utc>,
    pub key: String,
    pub keep_id: String,
    pub losers: Vec<JournalLoser>,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLoser {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    pub fn new(
        run_id: &str,
        key: &str,
        keep_id: &str,
        losers: &[PrimaryEntity],
        dependents: &[DependentRef],
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            at: Utc::now(),
            key: key.to_string(),
            keep_id: keep_id.to_string(),
            losers: losers
                .iter()
                .map(|l| JournalLoser {
                    id: l.id.clone(),
                    name: l.name.clone(),
                    created_at: l.created_at,
                })
                .collect(),
            dependents: dependents.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Append-only JSON-lines file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.file, "{line}")
            .and_then(|_| self.file.sync_data())
            .with_context(|| format!("writing journal {}", self.path.display()))
    }

    pub fn read_all(path: &Path) -> Result<Vec<JournalEntry>> {
        let file = File::open(path).with_context(|| format!("reading journal {}", path.display()))?;
        BufReader::new(file)
            .lines()
            .filter(|l| l.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(true))
            .map(|l| -> Result<JournalEntry> { Ok(serde_json::from_str(&l?)?) })
            .collect()
    }
}
