//! Bounded retry with a fixed delay between attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a retried operation that never succeeded
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait between a failed attempt and the next one
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. On success returns the value
    /// together with the attempt that produced it.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<(T, u32), RetryExhausted<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}", operation, attempt);
                    }
                    return Ok((value, attempt));
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Giving up.",
                        operation, attempt, max_attempts, e
                    );
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        operation, attempt, max_attempts, e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_makes_three_spaced_attempts() {
        let policy = RetryPolicy::default();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let recorded = stamps.clone();
        let result: Result<((), u32), _> = policy
            .run("connect", |_| {
                recorded.lock().unwrap().push(Instant::now());
                async { Err::<(), _>("refused") }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "refused");

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2));
        }
        // No trailing sleep after the final failure
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let policy = RetryPolicy::default();
        let result = policy
            .run("connect", |attempt| async move {
                if attempt < 3 {
                    Err("timeout")
                } else {
                    Ok(attempt * 10)
                }
            })
            .await;

        let (value, attempts) = result.unwrap();
        assert_eq!(value, 30);
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_does_not_wait() {
        let start = Instant::now();
        let (_, attempts) = RetryPolicy::default()
            .run("connect", |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
    }
}
