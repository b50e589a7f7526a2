//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_err() {
            // Fallback to the crate root so `cargo run` from a subdirectory still works.
            let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
            let _ = dotenv::from_filename(candidate);
        }
    });
}

/// Common bootstrap for CLI binaries: load env once and report which
/// backends are configured.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    let has_db = db_url().is_ok();
    let has_rest = rest_credentials().is_ok();
    if has_db || has_rest {
        info!(
            target = "bootstrap",
            bin = bin_name,
            postgres = has_db,
            rest = has_rest,
            "store credentials detected"
        );
    } else {
        warn!(
            target = "bootstrap",
            bin = bin_name,
            "neither SUPABASE_DB_URL/DATABASE_URL nor SUPABASE_URL + service key are set"
        );
    }
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    env_opt(key).ok_or_else(|| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_opt(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        None => default,
    }
}

/// Postgres DSN, first match wins.
pub fn db_url() -> anyhow::Result<String> {
    for k in ["SUPABASE_DB_URL", "DATABASE_URL", "DB_URL"] {
        if let Some(v) = env_opt(k) {
            return Ok(prefer_session_mode(&v));
        }
    }
    Err(anyhow::anyhow!("no database URL env vars set"))
}

/// If the URL looks like Supabase's transaction pooler (port 6543),
/// prefer the session pooler (5432) so the group transaction stays on one backend.
pub fn prefer_session_mode(url: &str) -> String {
    if url.contains("pooler.supabase.com:6543") && !env_flag("DISABLE_SESSION_SWAP", false) {
        tracing::warn!(
            "detected Supabase transaction pooler (:6543); switching to :5432 (session)"
        );
        url.replace("pooler.supabase.com:6543", "pooler.supabase.com:5432")
    } else {
        url.to_string()
    }
}

/// `(SUPABASE_URL, service key)` for the REST backend.
pub fn rest_credentials() -> anyhow::Result<(String, String)> {
    let url = env_req("SUPABASE_URL")?;
    let key = env_opt("SUPABASE_SERVICE_ROLE_KEY")
        .or_else(|| env_opt("SUPABASE_SERVICE_KEY"))
        .or_else(|| env_opt("SUPABASE_KEY"))
        .ok_or_else(|| anyhow::anyhow!("missing env var SUPABASE_SERVICE_ROLE_KEY"))?;
    Ok((url, key))
}

pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD")
        || k.contains("SECRET")
        || k.contains("KEY")
        || k.contains("TOKEN")
    {
        return "***".to_string();
    }

    let val_trim = val.trim();

    // Always redact postgres DSNs even if the key isn't obviously sensitive.
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }

    val_trim.to_string()
}

/// Validate required keys and log a consolidated, redacted snapshot of configuration.
/// Returns error if any required key is missing.
pub fn preflight_check(title: &str, required: &[&str], also_log: &[&str]) -> anyhow::Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| env_opt(k).is_none())
        .collect();
    let snapshot: Vec<(String, String)> = also_log
        .iter()
        .map(|&k| {
            let v = env_opt(k).unwrap_or_default();
            (k.to_string(), redact_value(k, &v))
        })
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
    if !missing.is_empty() {
        return Err(anyhow::anyhow!("missing required env: {:?}", missing));
    }
    Ok(())
}
