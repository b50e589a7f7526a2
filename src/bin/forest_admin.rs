use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use forest_admin::cli::details::{DetailArgs, DetailsConfig, RewriteConfig};
use forest_admin::cli::{dedupe, details, orphans, verify, Backend, EntityArgs, StoreConfig};
use forest_admin::reconcile::survivor::SurvivorPolicy;
use forest_admin::util::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "forest-admin", version, about = "Social-forestry registry admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct StoreOpts {
    /// Store backend (default: RECONCILE_BACKEND, else pg when a DSN is set)
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
    /// Optional override for max pool connections (default: DB_MAX_CONNS/5)
    #[arg(long)]
    max_connections: Option<u32>,
    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 30)]
    call_timeout_secs: u64,
}

impl StoreOpts {
    fn into_config(self) -> StoreConfig {
        StoreConfig {
            backend: self.backend,
            database_url: self.db_url,
            max_connections: self.max_connections,
            call_timeout: Some(Duration::from_secs(self.call_timeout_secs.max(1))),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct EntityOpts {
    /// Primary table holding the entities to deduplicate
    #[arg(long, default_value = "regions")]
    primary_table: String,
    #[arg(long, default_value = "id")]
    id_column: String,
    #[arg(long, default_value = "name")]
    name_column: String,
    /// Timestamp column used for tie-breaks; pass "" when the table has none
    #[arg(long, default_value = "created_at")]
    created_column: String,
}

impl EntityOpts {
    fn into_args(self) -> EntityArgs {
        EntityArgs {
            table: self.primary_table,
            id_column: self.id_column,
            name_column: self.name_column,
            created_column: self.created_column,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct DetailOpts {
    /// Detail table, unique on the owner column
    #[arg(long, default_value = "institutions")]
    table: String,
    #[arg(long, default_value = "id")]
    id_column: String,
    #[arg(long, default_value = "holding_id")]
    owner_column: String,
    #[arg(long, default_value = "created_at")]
    created_column: String,
}

impl DetailOpts {
    fn into_args(self) -> DetailArgs {
        DetailArgs {
            table: self.table,
            id_column: self.id_column,
            owner_column: self.owner_column,
            created_column: self.created_column,
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Merge duplicate entities: repoint references onto one survivor, delete the rest
    Dedupe {
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        entity: EntityOpts,
        /// Dependent tables as table:fk_column, comma-separated (default: RECONCILE_TABLES)
        #[arg(long)]
        tables: Option<String>,
        /// How the survivor of each group is chosen
        #[arg(long, value_enum, default_value_t = SurvivorPolicy::MostReferenced)]
        policy: SurvivorPolicy,
        /// When set, only plans and reports without mutating the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Replace the default leading qualifiers (KABUPATEN,KAB.,KAB)
        #[arg(long)]
        strip_prefixes: Option<String>,
        /// Max count queries in flight (default: RECONCILE_CONCURRENCY/4)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Attempts per remote call (default: RECONCILE_MAX_ATTEMPTS/4)
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Abort after this many groups in a row fail with transient errors
        #[arg(long)]
        max_consecutive_failures: Option<usize>,
        /// Overall run deadline in seconds
        #[arg(long, default_value_t = 1800)]
        deadline_secs: u64,
        /// Append a JSON line per group before its first write
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Single-instance lock file (default: <tmp>/forest-admin-<table>.lock)
        #[arg(long)]
        lock_file: Option<PathBuf>,
        /// Skip the single-instance lock
        #[arg(long, default_value_t = false)]
        no_lock: bool,
        /// Print the run summary as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report canonical names that still map to more than one entity
    Verify {
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        entity: EntityOpts,
        #[arg(long)]
        strip_prefixes: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove duplicate detail rows, keeping the newest per owner
    Details {
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        detail: DetailOpts,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Update a dependent row while keeping exactly one detail row for it
    RewriteDependent {
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        detail: DetailOpts,
        #[arg(long, default_value = "holdings")]
        dependent_table: String,
        #[arg(long, default_value = "id")]
        dependent_id_column: String,
        /// Id of the dependent row
        #[arg(long)]
        id: String,
        /// column=value applied to the dependent row (repeatable)
        #[arg(long = "set", required = true)]
        set: Vec<String>,
        /// column=value for the detail row inserted when no trigger creates one
        #[arg(long = "detail-value")]
        detail_values: Vec<String>,
    },
    /// List dependent foreign-key values that match no primary entity
    Orphans {
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        entity: EntityOpts,
        #[arg(long)]
        tables: Option<String>,
        /// Dangling values printed per table (0 = all)
        #[arg(long, default_value_t = 20)]
        sample: usize,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Dedupe {
            store,
            entity,
            tables,
            policy,
            dry_run,
            strip_prefixes,
            concurrency,
            max_attempts,
            max_consecutive_failures,
            deadline_secs,
            journal,
            lock_file,
            no_lock,
            json,
        } => {
            dedupe::run(dedupe::DedupeConfig {
                store: store.into_config(),
                entity: entity.into_args(),
                tables,
                policy,
                dry_run,
                strip_prefixes,
                concurrency,
                max_attempts,
                max_consecutive_failures,
                deadline: Some(Duration::from_secs(deadline_secs.max(1))),
                journal,
                lock_file,
                no_lock,
                json,
            })
            .await
        }
        Commands::Verify {
            store,
            entity,
            strip_prefixes,
            json,
        } => {
            verify::run(verify::VerifyConfig {
                store: store.into_config(),
                entity: entity.into_args(),
                strip_prefixes,
                json,
            })
            .await
        }
        Commands::Details {
            store,
            detail,
            dry_run,
            json,
        } => {
            details::run(DetailsConfig {
                store: store.into_config(),
                detail: detail.into_args(),
                dry_run,
                json,
            })
            .await
        }
        Commands::RewriteDependent {
            store,
            detail,
            dependent_table,
            dependent_id_column,
            id,
            set,
            detail_values,
        } => {
            details::rewrite(RewriteConfig {
                store: store.into_config(),
                detail: detail.into_args(),
                dependent_table,
                dependent_id_column,
                id,
                set,
                detail_values,
            })
            .await?;
            Ok(0)
        }
        Commands::Orphans {
            store,
            entity,
            tables,
            sample,
            json,
        } => {
            orphans::run(orphans::OrphansConfig {
                store: store.into_config(),
                entity: entity.into_args(),
                tables,
                sample,
                json,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    env::init_env();
    let _ = forest_admin::logging::init_tracing("info");
    env::bootstrap_cli("forest-admin");

    let cli = Cli::parse();
    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}
