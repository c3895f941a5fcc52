//! Exponential backoff with jitter.
//!
//! `delay(attempt) = min(base * 2^attempt, max) + uniform(0, jitter)`.
//! The jitter keeps many tills from retrying in lockstep after an outage.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay of attempt 0 before jitter.
    pub base: Duration,
    /// Cap on the exponential term.
    pub max: Duration,
    /// Upper bound of the uniform jitter.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter: Duration::from_millis(300),
        }
    }
}

impl BackoffConfig {
    /// Sets the base delay.
    #[must_use]
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the cap.
    #[must_use]
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The clamped exponential term.
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// The delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.delay_without_jitter(attempt) + Duration::from_millis(jitter)
    }
}

/// Runs `op` up to `attempts` times, sleeping between failures.
pub async fn retry<T, E, F, Fut>(config: &BackoffConfig, attempts: u32, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(config, attempts, |_| true, op).await
}

/// Like [`retry`], but gives up early on errors `should_retry` rejects.
pub async fn retry_if<T, E, F, Fut, P>(
    config: &BackoffConfig,
    attempts: u32,
    mut should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts && should_retry(&e) => {
                let delay = config.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_without_jitter(0), Duration::from_secs(1));
        assert_eq!(config.delay_without_jitter(3), Duration::from_secs(8));
        assert_eq!(config.delay_without_jitter(5), Duration::from_secs(30));
        assert_eq!(config.delay_without_jitter(200), Duration::from_secs(30));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let config = BackoffConfig::default().with_jitter(Duration::ZERO);
        assert_eq!(config.delay(2), Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn delay_within_bounds(attempt in 0u32..64) {
            let config = BackoffConfig::default();
            let floor = config.delay_without_jitter(attempt);
            let delay = config.delay(attempt);
            prop_assert!(delay >= floor);
            prop_assert!(delay <= floor + Duration::from_millis(300));
        }

        #[test]
        fn floor_is_non_decreasing(attempt in 0u32..64) {
            let config = BackoffConfig::default();
            prop_assert!(config.delay_without_jitter(attempt) <= config.delay_without_jitter(attempt + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_between_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let config = BackoffConfig::default().with_jitter(Duration::ZERO);
        let started = tokio::time::Instant::now();

        let result: Result<u32, &str> = retry(&config, 3, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("flaky")
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = retry(&BackoffConfig::default(), 3, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_if_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = retry_if(
            &BackoffConfig::default(),
            5,
            |e| *e != "fatal",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("fatal")
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
