//! Per-step retry discipline.
//!
//! Retryable driver failures back off exponentially (base 500 ms, doubled,
//! capped at 30 s) for at most 8 attempts. Terminal failures and abort
//! requests surface immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tracing::warn;

use vdc_api_types::error_code;
use vdc_rest_server::WorkerTask;

pub const RETRY_BASE: Duration = Duration::from_millis(500);
pub const RETRY_CAP: Duration = Duration::from_secs(30);
pub const RETRY_ATTEMPTS: u32 = 8;

pub fn backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    RETRY_BASE.saturating_mul(factor).min(RETRY_CAP)
}

/// Run one reconciliation step, retrying transient failures.
pub async fn step<F, Fut, T>(
    worker: &Arc<WorkerTask>,
    name: &str,
    mut run: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        worker.check_abort()?;
        match run().await {
            Ok(value) => return Ok(value),
            Err(err) if error_code(&err).is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = backoff(attempt);
                warn!("step {name} failed (attempt {}): {err:#}, retrying in {delay:?}", attempt + 1);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => (),
                    _ = worker.abort_future() => (),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(5), Duration::from_secs(16));
        assert_eq!(backoff(6), RETRY_CAP);
        assert_eq!(backoff(20), RETRY_CAP);
    }
}
