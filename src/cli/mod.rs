pub mod dedupe;
pub mod details;
pub mod orphans;
pub mod verify;

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::info;

use crate::database_ops::db::Db;
use crate::database_ops::rest::{self, RestStore};
use crate::database_ops::{validate_ident, DependentRef, EntityTable, Store};
use crate::util::env as env_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Direct Postgres connection (SUPABASE_DB_URL / DATABASE_URL).
    Pg,
    /// PostgREST endpoint (SUPABASE_URL + service-role key).
    Rest,
}

impl Backend {
    /// RECONCILE_BACKEND wins; otherwise Postgres when a DSN is configured.
    pub fn from_env() -> Result<Self> {
        match env_util::env_opt("RECONCILE_BACKEND").as_deref().map(str::trim) {
            Some("pg") | Some("postgres") => Ok(Backend::Pg),
            Some("rest") => Ok(Backend::Rest),
            Some(other) => bail!("RECONCILE_BACKEND must be pg or rest, got {other:?}"),
            None if env_util::db_url().is_ok() => Ok(Backend::Pg),
            None => Ok(Backend::Rest),
        }
    }
}

/// Connection settings shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub backend: Option<Backend>,
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub call_timeout: Option<Duration>,
}

pub async fn connect_store(cfg: &StoreConfig) -> Result<Box<dyn Store>> {
    let backend = match cfg.backend {
        Some(b) => b,
        None => Backend::from_env()?,
    };
    let timeout = cfg.call_timeout.unwrap_or(Duration::from_secs(30));
    match backend {
        Backend::Pg => {
            let url = match cfg.database_url.clone() {
                Some(url) => env_util::prefer_session_mode(&url),
                None => env_util::db_url()?,
            };
            let max = cfg
                .max_connections
                .unwrap_or_else(|| env_util::env_parse("DB_MAX_CONNS", 5u32));
            info!(url = %env_util::redact_value("DATABASE_URL", &url), max, "connecting to postgres");
            let db = Db::connect(&url, max, timeout)
                .await
                .context("connecting to postgres")?;
            Ok(Box::new(db))
        }
        Backend::Rest => {
            let (base, key) = env_util::rest_credentials()?;
            let page_size = env_util::env_parse("RECONCILE_PAGE_SIZE", rest::DEFAULT_PAGE_SIZE);
            info!(url = %base, page_size, "using rest endpoint");
            Ok(Box::new(RestStore::new(&base, &key, timeout)?.with_page_size(page_size)))
        }
    }
}

/// Column mapping for the primary table as given on the command line.
#[derive(Debug, Clone)]
pub struct EntityArgs {
    pub table: String,
    pub id_column: String,
    pub name_column: String,
    /// Empty string disables the timestamp column.
    pub created_column: String,
}

impl Default for EntityArgs {
    fn default() -> Self {
        Self {
            table: "regions".into(),
            id_column: "id".into(),
            name_column: "name".into(),
            created_column: "created_at".into(),
        }
    }
}

impl EntityArgs {
    pub fn to_table(&self) -> Result<EntityTable> {
        let table = EntityTable {
            table: self.table.clone(),
            id_column: self.id_column.clone(),
            name_column: self.name_column.clone(),
            created_column: Some(self.created_column.trim())
                .filter(|c| !c.is_empty())
                .map(String::from),
        };
        validate_ident(&table.table)?;
        for col in table.columns() {
            validate_ident(col)?;
        }
        Ok(table)
    }
}

/// `--tables`, falling back to RECONCILE_TABLES.
pub fn resolve_dependents(raw: Option<&str>) -> Result<Vec<DependentRef>> {
    let raw = match raw {
        Some(r) => r.to_string(),
        None => env_util::env_opt("RECONCILE_TABLES")
            .context("no dependent tables given; pass --tables table:fk,... or set RECONCILE_TABLES")?,
    };
    let deps = crate::config::parse_dependents(&raw)?;
    if deps.is_empty() {
        bail!("no dependent tables given");
    }
    Ok(deps)
}
