use crate::error::{BotError, Result};
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;

/// Exponential backoff with optional jitter.
///
/// Delay for attempt `n` is `min(max_delay, base * 2^n)` plus up to
/// `jitter_factor` of that delay in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Deterministic backoff, used where retries must be predictable
    pub fn without_jitter(base: Duration, max_delay: Duration) -> Self {
        Self::new(base, max_delay, 0.0)
    }

    /// Delay for the given attempt without touching the counter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Next delay; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let spread = capped.as_secs_f64() * self.jitter_factor;
        if spread <= 0.0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Sleep for `delay` unless shutdown is signalled first
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    if *shutdown.borrow() {
        return Err(BotError::Shutdown);
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(BotError::Shutdown);
                }
            }
            _ = &mut sleep => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff =
            ExponentialBackoff::without_jitter(Duration::from_secs(1), Duration::from_secs(32));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn test_reset() {
        let mut backoff =
            ExponentialBackoff::without_jitter(Duration::from_millis(500), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay().as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {} out of range", d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_secs(5), &mut rx).await.is_ok());

        tx.send(true).unwrap();
        assert!(matches!(
            sleep_or_shutdown(Duration::from_secs(5), &mut rx).await,
            Err(BotError::Shutdown)
        ));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let backoff =
            ExponentialBackoff::without_jitter(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(30));
    }
}
