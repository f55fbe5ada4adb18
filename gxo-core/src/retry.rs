//! Generic retry helper (spec §4.6): exponential backoff with jitter,
//! wrapping any cancellable async operation.

use crate::error::{GxoError, Result};
use rand::Rng;
use std::time::Duration;

/// Normalized retry policy. Build via [`crate::playbook::RetryConfig::to_policy`],
/// which applies the clamping rules described on each field below.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Clamped to at least 1.
    pub attempts: usize,
    /// Base delay before the first retry.
    pub delay: Duration,
    /// Upper bound on the (pre-jitter) computed delay, if any.
    pub max_delay: Option<Duration>,
    /// Multiplier applied to the delay after each failed attempt. Clamped
    /// to at least 1.0 (never shrinks the delay).
    pub backoff_factor: f64,
    /// Fractional jitter in `[0, 1]`; the applied delay is drawn uniformly
    /// from `[delay * (1 - jitter), delay * (1 + jitter)]`.
    pub jitter: f64,
    /// Whether a module-reported error is retryable at all. When `false`,
    /// [`retry`] runs the operation exactly once.
    pub on_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::from_secs(1),
            max_delay: None,
            backoff_factor: 1.0,
            jitter: 0.0,
            on_error: true,
        }
    }
}

/// Run `op` up to `policy.attempts` times, sleeping with exponential
/// backoff and jitter between failures. Returns the first success, or the
/// last error once attempts are exhausted. The sleep is cancellation-aware:
/// if `cancel` fires while waiting, the wait is cut short and
/// [`GxoError::Cancelled`] is returned immediately instead of the
/// underlying error.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, cancel: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.delay;
    let mut last_err = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(GxoError::Cancelled);
        }
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if e.is_cancellation_or_deadline() || !policy.on_error {
                    return Err(e);
                }
                last_err = Some(e);
                if attempt == attempts {
                    break;
                }
                let sleep_for = jittered(delay, policy.jitter, policy.max_delay);
                tracing::debug!(attempt, ?sleep_for, "retrying after failure");
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = cancel.cancelled() => return Err(GxoError::Cancelled),
                }
                delay = scale(delay, policy.backoff_factor, policy.max_delay);
            }
        }
    }
    Err(last_err.unwrap_or(GxoError::TaskExecution("retry exhausted with no recorded error".to_string())))
}

fn scale(delay: Duration, backoff_factor: f64, max_delay: Option<Duration>) -> Duration {
    let factor = backoff_factor.max(1.0);
    let scaled = delay.mul_f64(factor);
    cap(scaled, max_delay)
}

fn jittered(delay: Duration, jitter: f64, max_delay: Option<Duration>) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    let delay = cap(delay, max_delay);
    if jitter == 0.0 {
        return delay;
    }
    let low = (1.0 - jitter).max(0.0);
    let high = 1.0 + jitter;
    let factor = rand::thread_rng().gen_range(low..=high);
    let millis = (delay.as_secs_f64() * factor).max(0.0);
    cap(Duration::from_secs_f64(millis), max_delay)
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) if delay > max => max,
        _ => delay,
    }
}

/// Minimal stand-in for `tokio_util::sync::CancellationToken` (that crate
/// is not part of the dependency set): a `tokio::sync::watch`-backed flag
/// that is cheap to clone and awaitable.
mod tokio_util_shim {
    use tokio::sync::watch;

    #[derive(Clone)]
    pub struct CancellationToken {
        tx: std::sync::Arc<watch::Sender<bool>>,
        rx: watch::Receiver<bool>,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            let (tx, rx) = watch::channel(false);
            Self {
                tx: std::sync::Arc::new(tx),
                rx,
            }
        }

        pub fn cancel(&self) {
            let _ = self.tx.send(true);
        }

        pub fn is_cancelled(&self) -> bool {
            *self.rx.borrow()
        }

        pub async fn cancelled(&self) {
            let mut rx = self.rx.clone();
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    impl Default for CancellationToken {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use tokio_util_shim::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        let result: Result<i32> = retry(&policy, &cancel, |_attempt| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        let result: Result<&str> = retry(&policy, &cancel, |attempt| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(GxoError::TaskExecution("transient".to_string()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result: Result<()> = retry(&policy, &cancel, |_attempt| async {
            Err(GxoError::TaskExecution("always fails".to_string()))
        })
        .await;
        assert!(matches!(result, Err(GxoError::TaskExecution(_))));
    }

    #[tokio::test]
    async fn on_error_false_runs_once() {
        let policy = RetryPolicy {
            attempts: 5,
            on_error: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        let _: Result<()> = retry(&policy, &cancel, |_attempt| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(GxoError::TaskExecution("nope".to_string()))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_wait() {
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_secs(30),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel2.cancel();
        });
        let result: Result<()> = retry(&policy, &cancel, |_attempt| async {
            Err(GxoError::TaskExecution("fails".to_string()))
        })
        .await;
        assert!(matches!(result, Err(GxoError::Cancelled)));
    }

    #[test]
    fn jitter_bounds_stay_within_range() {
        let delay = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = jittered(delay, 0.5, None);
            assert!(d.as_millis() >= 500 && d.as_millis() <= 1500);
        }
    }

    #[test]
    fn cap_clamps_to_max_delay() {
        let d = cap(Duration::from_secs(10), Some(Duration::from_secs(5)));
        assert_eq!(d, Duration::from_secs(5));
    }
}
