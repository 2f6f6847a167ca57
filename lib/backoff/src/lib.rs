//! `tokio-retry` crate
//! MIT License
//! Copyright (c) 2017 Sam Rijs
//!

use std::time::Duration;

/// Exponential back-off between attempts to re-establish something, e.g. a
/// watch request. The n-th delay is `base^n * factor` milliseconds, capped
/// by `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1,
            max_delay: None,
        }
    }

    /// Multiplies every delay, a factor of `1000` turns milliseconds into seconds.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// The delay of the next attempt, advancing the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current.saturating_mul(self.factor));
        if let Some(max_delay) = self.max_delay {
            if delay >= max_delay {
                return max_delay;
            }
        }

        self.current = self.current.saturating_mul(self.base);

        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await
    }

    /// Starts over from the first delay, called once an attempt succeeded.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially() {
        let mut backoff = ExponentialBackoff::from_millis(2).factor(250);

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn saturates() {
        let mut backoff = ExponentialBackoff::from_millis(u64::MAX - 1);

        assert_eq!(backoff.next_delay(), Duration::from_millis(u64::MAX - 1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(u64::MAX));
        assert_eq!(backoff.next_delay(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn capped_by_max_delay() {
        let mut backoff = ExponentialBackoff::from_millis(2)
            .factor(1000)
            .max_delay(Duration::from_secs(5));

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn max_delay_below_base() {
        let mut backoff = ExponentialBackoff::from_millis(20).max_delay(Duration::from_millis(10));

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = ExponentialBackoff::from_millis(3);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_the_delay() {
        let mut backoff = ExponentialBackoff::from_millis(10);
        let start = tokio::time::Instant::now();

        backoff.wait().await;
        backoff.wait().await;

        assert_eq!(start.elapsed(), Duration::from_millis(110));
    }
}
