use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::database_ops::StoreError;

/// Single-instance guard for write runs. The lock file is created with
/// `create_new` and removed on drop; a stale file left by a killed run has to
/// be removed by the operator.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                return Err(StoreError::Config(format!(
                    "another reconcile run holds {} ({}); remove it if that run is dead",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(e) => {
                return Err(StoreError::Config(format!(
                    "cannot create lock file {}: {e}",
                    path.display()
                )))
            }
        };
        let _ = writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339());
        info!(path = %path.display(), "run lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// `<tmp>/forest-admin-<table>.lock`
    pub fn default_path(table: &str) -> PathBuf {
        std::env::temp_dir().join(format!("forest-admin-{}.lock", table.replace('.', "_")))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}
