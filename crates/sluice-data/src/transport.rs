//! Retry policy shared by the HTTP clients.
//!
//! Transport-level failures (connect errors, timeouts, 429/5xx responses)
//! are retried with exponential backoff; everything else surfaces
//! immediately. The retry budget is unbounded by default, so the pipeline
//! rides out upstream outages; the runner never retries transport errors
//! itself.

use eyre::Result;
use std::future::Future;
use std::time::Duration;

/// Baseline request timeout for both upstream clients.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry budget. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn limited(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }
}

/// One attempt's failure, classified by whether it is worth retrying.
#[derive(Debug)]
pub enum Attempt {
    Retry(eyre::Report),
    Fatal(eyre::Report),
}

/// Classifies a reqwest error. Anything that made it past request building
/// is assumed transient.
pub fn classify_request_error(err: reqwest::Error, what: &str) -> Attempt {
    if err.is_builder() {
        Attempt::Fatal(eyre::Report::new(err).wrap_err(format!("{what}: invalid request")))
    } else {
        Attempt::Retry(eyre::Report::new(err).wrap_err(what.to_string()))
    }
}

/// Classifies a non-success HTTP status: rate limiting and server errors are
/// transient, other client errors are not.
pub fn classify_status(status: reqwest::StatusCode, body: String, what: &str) -> Attempt {
    let report = eyre::eyre!("{what}: HTTP {}: {}", status.as_u16(), body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Attempt::Retry(report)
    } else {
        Attempt::Fatal(report)
    }
}

/// Runs `operation` until it succeeds, fails fatally, or exhausts the retry
/// budget, sleeping with exponential backoff between transient failures.
pub async fn with_backoff<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Attempt>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(report)) => return Err(report),
            Err(Attempt::Retry(report)) => {
                attempt += 1;
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(report.wrap_err(format!(
                        "{what}: giving up after {attempt} attempts"
                    )));
                }
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %report,
                    "transient upstream failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_backoff("test op", &RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(Attempt::Retry(eyre::eyre!("transient")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_failures_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("test op", &RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Attempt::Fatal(eyre::eyre!("bad request"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_budget_gives_up() {
        let result: Result<()> = with_backoff("test op", &RetryPolicy::limited(2), || async {
            Err(Attempt::Retry(eyre::eyre!("still down")))
        })
        .await;
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("giving up after 2 attempts"), "{message}");
    }
}
