// ── Retry orchestration ──
//
// Every network operation runs through `operation_with_retries`: each
// attempt gets its own deadline, retryable failures consult a stateful
// policy, and the wait between attempts is interrupted by the caller's context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::context::Context;
use crate::error::CoreError;

/// Decides when (or whether) to try again after a failure.
pub trait RetryPolicy: Send {
    /// Instant of the next attempt, or the reason to give up.
    fn next_attempt(&mut self) -> Result<Instant, String>;
}

/// Produces a fresh policy per operation.
pub type RetryFactory = Arc<dyn Fn() -> Box<dyn RetryPolicy> + Send + Sync>;

// ── Stock policies ───────────────────────────────────────────────────

/// A fixed number of attempts separated by a constant delay.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    attempts: u32,
    delay: Duration,
    failures: u32,
}

impl FixedRetry {
    /// `attempts` counts the first try; `1` never retries.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            failures: 0,
        }
    }
}

impl RetryPolicy for FixedRetry {
    fn next_attempt(&mut self) -> Result<Instant, String> {
        self.failures += 1;
        if self.failures >= self.attempts {
            return Err(format!("giving up after {} attempts", self.attempts));
        }
        Ok(Instant::now() + self.delay)
    }
}

/// Doubling delay with deterministic jitter and an optional attempt cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            failures: 0,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_attempt(&mut self) -> Result<Instant, String> {
        let retry = self.failures;
        self.failures += 1;
        if let Some(max) = self.max_attempts {
            if self.failures >= max {
                return Err(format!("giving up after {max} attempts"));
            }
        }
        Ok(Instant::now() + calculate_backoff(retry, self.initial_delay, self.max_delay))
    }
}

/// `delay = min(initial * 2^retry, max)` scaled by a ±25% jitter seeded
/// from the retry number.
fn calculate_backoff(retry: u32, initial: Duration, max: Duration) -> Duration {
    let exp = i32::try_from(retry).unwrap_or(i32::MAX).min(62);
    let base = initial.as_secs_f64() * 2.0_f64.powi(exp);
    let capped = base.min(max.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(retry) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

// ── Configuration ────────────────────────────────────────────────────

/// Serializable retry policy selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryConfig {
    /// Single attempt.
    Never,
    Fixed {
        attempts: u32,
        delay_ms: u64,
    },
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            max_attempts: Some(5),
        }
    }
}

impl RetryConfig {
    pub fn factory(&self) -> RetryFactory {
        match *self {
            Self::Never => Arc::new(|| Box::new(FixedRetry::new(1, Duration::ZERO))),
            Self::Fixed { attempts, delay_ms } => Arc::new(move || {
                Box::new(FixedRetry::new(attempts, Duration::from_millis(delay_ms)))
            }),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                max_attempts,
            } => Arc::new(move || {
                Box::new(ExponentialBackoff::new(
                    Duration::from_millis(initial_delay_ms),
                    Duration::from_millis(max_delay_ms),
                    max_attempts,
                ))
            }),
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────

/// Run `op` until it succeeds, the policy gives up, or `ctx` ends.
///
/// Each attempt runs under a child of `ctx` with `per_attempt` timeout.
/// When the policy gives up the error carries the last attempt's failure.
/// A permanent failure (see [`CoreError::is_permanent`]) is returned as is
/// without another attempt.
pub async fn operation_with_retries<T, F, Fut>(
    ctx: &Context,
    retry: &RetryFactory,
    per_attempt: Duration,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut policy = retry();
    let mut attempt: u32 = 0;
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        attempt += 1;

        let attempt_ctx = ctx.with_timeout(per_attempt);
        let result = attempt_ctx.run(op(attempt_ctx.clone())).await;
        attempt_ctx.cancel();

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_permanent() {
            tracing::debug!(attempt, error = %err, "permanent failure, not retrying");
            return Err(err);
        }

        match policy.next_attempt() {
            Err(reason) => {
                tracing::debug!(attempt, error = %err, %reason, "retries exhausted");
                return Err(CoreError::RetryExhausted {
                    reason,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Ok(when) => {
                tracing::debug!(attempt, error = %err, "attempt failed, retrying");
                ctx.sleep_until(when).await?;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_increases_then_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        let d0 = calculate_backoff(0, initial, max);
        let d1 = calculate_backoff(1, initial, max);
        let d2 = calculate_backoff(2, initial, max);
        assert!(d1 > d0, "d1 ({d1:?}) should exceed d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should exceed d1 ({d1:?})");
        assert!(calculate_backoff(40, initial, max) <= Duration::from_millis(1_250));
    }

    #[test]
    fn fixed_retry_counts_first_attempt() {
        let mut p = FixedRetry::new(3, Duration::ZERO);
        assert!(p.next_attempt().is_ok());
        assert!(p.next_attempt().is_ok());
        assert_eq!(p.next_attempt().unwrap_err(), "giving up after 3 attempts");
    }

    #[test]
    fn retry_config_deserializes_tagged() {
        let cfg: RetryConfig = serde_json::from_value(serde_json::json!({
            "policy": "fixed", "attempts": 4, "delay_ms": 10
        }))
        .unwrap();
        assert_eq!(
            cfg,
            RetryConfig::Fixed {
                attempts: 4,
                delay_ms: 10
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_n_attempts_with_last_cause() {
        let calls = Arc::new(AtomicU32::new(0));
        let factory = RetryConfig::Fixed {
            attempts: 3,
            delay_ms: 100,
        }
        .factory();

        let started = Instant::now();
        let counter = Arc::clone(&calls);
        let err = operation_with_retries(
            &Context::background(),
            &factory,
            Duration::from_secs(1),
            move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err::<(), _>(CoreError::internal(format!("boom {n}"))) }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            CoreError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.to_string(), "boom 3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = operation_with_retries(
            &Context::background(),
            &RetryConfig::Fixed {
                attempts: 5,
                delay_ms: 100,
            }
            .factory(),
            Duration::from_secs(1),
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(CoreError::resource(
                        "get",
                        "dev",
                        "/light/1",
                        ocfly_api::Error::Status {
                            code: ocfly_api::ResponseCode::Forbidden,
                            href: "/light/1".into(),
                        },
                    ))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is_permission_denied(), "{err:?}");
        assert!(!matches!(err, CoreError::RetryExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_and_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let value = operation_with_retries(
            &Context::background(),
            &RetryConfig::Fixed {
                attempts: 2,
                delay_ms: 0,
            }
            .factory(),
            Duration::from_millis(100),
            move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok(n)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_deadline_interrupts_backoff() {
        let ctx = Context::timeout(Duration::from_millis(500));
        let err = operation_with_retries(
            &ctx,
            &RetryConfig::Fixed {
                attempts: 10,
                delay_ms: 60_000,
            }
            .factory(),
            Duration::from_millis(100),
            |_ctx| async { Err::<(), _>(CoreError::internal("down")) },
        )
        .await
        .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }
}
