//! Exponential backoff shared by the reconciler's requeue logic and the
//! client-side polling helpers.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("timed out after {elapsed:?} waiting for {what}")]
pub struct PollTimeout {
    pub what: String,
    pub elapsed: Duration,
}

/// Polls `check` until it yields a value or `timeout` elapses.
///
/// The interval starts at `backoff.initial` and doubles after every miss. The
/// deadline is checked before each attempt, so a check that starts in time is
/// always allowed to finish.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    timeout: Duration,
    backoff: Backoff,
    mut check: F,
) -> Result<T, PollTimeout>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        let elapsed = start.elapsed();
        if elapsed > timeout {
            return Err(PollTimeout {
                what: what.to_string(),
                elapsed,
            });
        }

        if let Some(value) = check().await {
            return Ok(value);
        }

        let delay = backoff.delay(attempt);
        tracing::debug!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "condition not met yet"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(3));
        assert_eq!(backoff.delay(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_after_misses() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = poll_until("third call", Duration::from_secs(60), Backoff::default(), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                (n == 3).then_some(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let result: Result<(), _> =
            poll_until("never", Duration::from_secs(5), Backoff::default(), || async {
                None
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.what, "never");
        assert!(err.elapsed > Duration::from_secs(5));
    }
}
