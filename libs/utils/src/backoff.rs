use std::fmt::{Debug, Display};

use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub async fn exponential_backoff(
    n: u32,
    base_increment: f64,
    max_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds =
        exponential_backoff_duration_seconds(n, base_increment, max_seconds);
    if backoff_duration_seconds > 0.0 {
        tracing::info!(
            "Backoff: waiting {backoff_duration_seconds} seconds before processing with the task",
        );

        drop(
            tokio::time::timeout(
                std::time::Duration::from_secs_f64(backoff_duration_seconds),
                cancel.cancelled(),
            )
            .await,
        )
    }
}

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

/// Retries passed operation until one of the following conditions are met:
/// - encountered error is considered as permanent (non-retryable)
/// - retries have been exhausted
/// - cancellation token has been cancelled
///
/// `is_permanent` closure should be used to provide distinction between
/// permanent and non-permanent errors. When attempts cross `warn_threshold`
/// function starts to emit log warnings. Returns `None` if cancellation was
/// noticed before the operation resolved.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    warn_threshold: u32,
    max_retries: u32,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    // Not std::error::Error because anyhow::Error doesnt implement it.
    // For context see https://github.com/dtolnay/anyhow/issues/63
    E: Display + Debug + 'static,
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = op().await;
        match &result {
            Ok(_) => {
                if attempts > 0 {
                    tracing::info!("{description} succeeded after {attempts} retries");
                }
                return Some(result);
            }

            // These are "permanent" errors that should not be retried.
            Err(e) if is_permanent(e) => {
                return Some(result);
            }
            // Assume that any other failure might be transient, and the operation might
            // succeed if we just keep trying.
            Err(err) if attempts < warn_threshold => {
                tracing::info!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(err) if attempts < max_retries => {
                tracing::warn!("{description} failed, will retry (attempt {attempts}): {err:#}");
            }
            Err(err) => {
                // Operation failed `max_attempts` times. Time to give up.
                tracing::warn!(
                    "{description} still failed after {attempts} retries, giving up: {err:?}"
                );
                return Some(result);
            }
        }
        // sleep and retry
        exponential_backoff(
            attempts,
            DEFAULT_BASE_BACKOFF_SECONDS,
            DEFAULT_MAX_BACKOFF_SECONDS,
            cancel,
        )
        .await;
        attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(exponential_backoff_duration_seconds(0, 0.1, 3.0), 0.0);
        let first = exponential_backoff_duration_seconds(1, 0.1, 3.0);
        let second = exponential_backoff_duration_seconds(2, 0.1, 3.0);
        assert!(first > 0.0 && second > first);
        assert_eq!(exponential_backoff_duration_seconds(100, 0.1, 3.0), 3.0);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<(), &str>> = retry(
            || async {
                attempts.fetch_add(1, Ordering::Relaxed);
                Err("permanent")
            },
            |e| *e == "permanent",
            2,
            10,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Err("permanent"))));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_returns_none_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<Result<(), &str>> = retry(
            || async { Err("transient") },
            |_| false,
            2,
            10,
            "test op",
            &cancel,
        )
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retry_eventually_succeeds() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = retry(
            || async {
                if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            },
            |_| false,
            5,
            10,
            "test op",
            &cancel,
        )
        .await;
        assert!(matches!(result, Some(Ok(42))));
    }
}
