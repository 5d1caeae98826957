//! Exponential backoff retry loop used by binlog uploads and flush
//! reports.

use std::fmt::Display;
use std::future::Future;
use tracing::warn;

use crate::config::RetryConfig;

/// Run `op` until it succeeds or the attempt budget is spent. With
/// `max_attempts: None` the loop never gives up; backoff is capped.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = config.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if let Some(max) = config.max_attempts {
                    if attempt >= max {
                        return Err(e);
                    }
                }
                warn!(what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry(&fast_config(Some(5)), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient")
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry(&fast_config(Some(3)), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("always")
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
