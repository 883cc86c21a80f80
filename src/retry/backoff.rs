use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::classifier::{OperationClass, RetryPolicy};
use crate::context::Context;
use crate::error::DbError;

pub const BACKOFF_MULTIPLIER: f64 = 2.0;
/// Delays are perturbed by up to this fraction in either direction.
pub const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff: `initial`, doubling per retry, ±10% jitter, capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    /// Build a backoff and the effective attempt budget. A budget of zero or
    /// less becomes a single attempt.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, max_attempts: i64) -> (Self, u32) {
        let attempts = u32::try_from(max_attempts.max(1)).unwrap_or(u32::MAX);
        let backoff = Self {
            initial,
            max: max.max(initial),
            multiplier: BACKOFF_MULTIPLIER,
            jitter: JITTER_FACTOR,
        };
        (backoff, attempts)
    }

    #[must_use]
    pub fn initial(&self) -> Duration {
        self.initial
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `retry` (0-based) without jitter.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + spread))
            .unwrap_or(self.max)
            .min(self.max)
    }

    #[must_use]
    pub fn start(&self) -> RetryState<'_> {
        RetryState {
            backoff: self,
            attempts: 0,
        }
    }
}

/// Attempt counter and backoff cursor for one logical call.
#[derive(Debug)]
pub struct RetryState<'a> {
    backoff: &'a Backoff,
    attempts: u32,
}

impl RetryState<'_> {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Jittered delay to wait before the next attempt.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let retry = self.attempts.saturating_sub(1);
        self.backoff.jittered(self.backoff.base_delay(retry))
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget runs out.
///
/// Errors the policy rejects for `class` end the call right away. Retryable
/// errors use up an attempt and wait out the backoff; when the budget is spent
/// the last error comes back unchanged. If `ctx` ends during a wait, its
/// error is returned and no further attempt starts.
///
/// # Errors
/// Returns the operation's final error or the context's error.
pub async fn retry_operation<T, F, Fut>(
    ctx: &Context,
    backoff: &Backoff,
    max_attempts: u32,
    class: OperationClass,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut state = backoff.start();

    loop {
        let attempt = state.begin_attempt();
        let err = match op().await {
            Ok(value) => {
                tracing::debug!(attempt, %class, outcome = "success", "database attempt finished");
                return Ok(value);
            }
            Err(err) => err,
        };

        if !policy.is_retryable(Some(&err), class) {
            tracing::debug!(attempt, %class, outcome = "permanent", error = %err, "database attempt failed");
            return Err(err);
        }
        if attempt >= max_attempts {
            tracing::warn!(attempt, %class, outcome = "exhausted", error = %err, "database retries exhausted");
            return Err(err);
        }

        let delay = state.next_delay();
        tracing::debug!(
            attempt,
            %class,
            outcome = "retrying",
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "database attempt failed, backing off"
        );
        if let Err(ctx_err) = ctx.sleep(delay).await {
            tracing::debug!(attempt, %class, outcome = "abandoned", error = %err, "context ended during backoff");
            return Err(ctx_err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_budgets_become_one_attempt() {
        let (_, zero) = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 0);
        let (_, negative) = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), -5);
        assert_eq!(zero, 1);
        assert_eq!(negative, 1);
    }

    #[test]
    fn base_delay_doubles_until_capped() {
        let (backoff, _) = Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 3);
        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.base_delay(10), Duration::from_secs(5));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ten_percent_and_below_cap() {
        let (backoff, _) = Backoff::new(Duration::from_millis(100), Duration::from_millis(150), 3);
        for _ in 0..200 {
            let first = backoff.jittered(backoff.base_delay(0));
            assert!(first >= Duration::from_millis(89) && first <= Duration::from_millis(111));
            let capped = backoff.jittered(backoff.base_delay(4));
            assert!(capped <= Duration::from_millis(150));
        }
    }

    #[test]
    fn huge_delays_saturate_at_the_cap() {
        let (backoff, _) = Backoff::new(Duration::MAX, Duration::MAX, 3);
        for retry in 0..3 {
            let delay = backoff.jittered(backoff.base_delay(retry));
            assert!(delay > Duration::from_secs(u64::MAX / 2));
        }
    }
}
