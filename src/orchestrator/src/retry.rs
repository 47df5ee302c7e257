//! Bounded retries for transient infrastructure failures
//!
//! Only `Transient` errors are retried, with jittered exponential backoff
//! and a hard attempt bound; everything else surfaces immediately. Write
//! paths deliberately do not retry — the reclaimer repairs partial writes
//! from the durable state instead.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::types::{OrchResult, OrchestratorError};

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 100;

/// Run `op`, retrying transient failures up to the attempt bound.
pub async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> OrchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(OrchestratorError::Transient(detail)) if attempt < MAX_ATTEMPTS => {
                attempt += 1;
                let backoff = BASE_DELAY_MS * (1 << attempt);
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = Duration::from_millis((backoff as f64 * jitter) as u64);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    detail,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OrchestratorError::Transient("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OrchestratorError::Validation("bad".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let err = with_backoff("op", || async {
            Err::<(), _>(OrchestratorError::Transient("down".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "transient_infra_error");
    }
}
