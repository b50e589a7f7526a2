//! Bounded retry with exponential backoff around single remote calls.
//!
//! Only [`StoreError::Transient`] is retried; a call that exceeds the per-call
//! timeout counts as transient. Everything else is returned on the first
//! attempt so constraint and configuration failures surface immediately.
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::database_ops::StoreError;
use crate::util::env::env_parse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Defaults overridden by RECONCILE_MAX_ATTEMPTS / RECONCILE_BACKOFF_MS /
    /// RECONCILE_CALL_TIMEOUT_SECS.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("RECONCILE_MAX_ATTEMPTS", d.max_attempts).max(1),
            base_delay: Duration::from_millis(env_parse(
                "RECONCILE_BACKOFF_MS",
                d.base_delay.as_millis() as u64,
            )),
            max_delay: d.max_delay,
            call_timeout: Duration::from_secs(env_parse(
                "RECONCILE_CALL_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )),
        }
    }

    #[cfg(test)]
    pub(crate) fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        }
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay.max(Duration::from_millis(1));
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let res = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Transient(format!(
                "{op} timed out after {:?}",
                policy.call_timeout
            ))),
        };
        match res {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                warn!(op, attempt, max_attempts, error = %e, "remote call failed; backing off");
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay = delay.saturating_mul(2).min(policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}
