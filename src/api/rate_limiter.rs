use crate::backoff::{sleep_or_shutdown, ExponentialBackoff};
use crate::config::ApiSettings;
use crate::error::{BotError, Result};
use governor::{DefaultDirectRateLimiter, Quota};
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Sliding record of call times inside the trailing window
#[derive(Debug)]
pub struct RateWindow {
    calls: VecDeque<Instant>,
    window: Duration,
    max_requests: usize,
}

impl RateWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            calls: VecDeque::with_capacity(max_requests),
            window,
            max_requests: max_requests.max(1),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long to wait before another call fits, or None if it fits now
    pub fn wait_needed(&mut self, now: Instant, buffer: Duration) -> Option<Duration> {
        self.evict(now);
        if self.calls.len() < self.max_requests {
            return None;
        }
        let oldest = *self.calls.front()?;
        let age = now.duration_since(oldest);
        Some(self.window.saturating_sub(age) + buffer)
    }

    pub fn record(&mut self, now: Instant) {
        self.calls.push_back(now);
    }

    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.calls.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub requests_in_window: usize,
    pub max_requests: usize,
    pub remaining: usize,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests_per_window: usize,
    pub window: Duration,
    pub buffer: Duration,
    pub burst_per_second: u32,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RateLimiterConfig {
    pub fn from_settings(api: &ApiSettings) -> Self {
        Self {
            max_requests_per_window: api.max_requests_per_minute,
            window: Duration::from_secs(60),
            buffer: Duration::from_millis(api.window_buffer_ms),
            burst_per_second: api.burst_per_second,
            max_retries: api.max_retries,
            backoff_base: Duration::from_millis(api.backoff_base_ms),
            backoff_max: Duration::from_millis(api.backoff_max_ms),
        }
    }
}

/// Throttles outbound API calls to the provider budget.
///
/// Calls are spaced by a per-second burst guard and bounded by a trailing
/// 60-second window. Provider rate-limit responses are retried with capped
/// exponential backoff; every other failure is returned untouched.
pub struct RateLimiter {
    config: RateLimiterConfig,
    window: Mutex<RateWindow>,
    burst: DefaultDirectRateLimiter,
    backoff: ExponentialBackoff,
    consecutive_failures: AtomicU32,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let per_second = NonZeroU32::new(config.burst_per_second)
            .ok_or_else(|| BotError::Config("burst_per_second must be positive".into()))?;

        Ok(Self {
            window: Mutex::new(RateWindow::new(config.max_requests_per_window, config.window)),
            burst: DefaultDirectRateLimiter::direct(Quota::per_second(per_second)),
            backoff: ExponentialBackoff::without_jitter(config.backoff_base, config.backoff_max),
            consecutive_failures: AtomicU32::new(0),
            shutdown: None,
            config,
        })
    }

    /// Abort waits and backoffs once shutdown is signalled
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Block until one more call fits the window, then record it
    pub async fn wait_if_needed(&self) -> Result<()> {
        loop {
            let wait = {
                let mut window = self.window.lock().map_err(|e| {
                    BotError::TransientNetwork(format!("rate window lock poisoned: {}", e))
                })?;
                let now = Instant::now();
                match window.wait_needed(now, self.config.buffer) {
                    None => {
                        window.record(now);
                        None
                    }
                    Some(wait) => Some(wait),
                }
            };

            match wait {
                None => break,
                Some(wait) => {
                    tracing::warn!(
                        wait_secs = wait.as_secs_f64(),
                        limit = self.config.max_requests_per_window,
                        "rate limit window full, waiting"
                    );
                    self.sleep(wait).await?;
                }
            }
        }

        self.burst.until_ready().await;
        Ok(())
    }

    /// Run `op` under the limiter, retrying provider rate-limit errors
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.wait_if_needed().await?;

            match op().await {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(BotError::RateLimited(msg)) if attempt < self.config.max_retries => {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited by provider: {}",
                        msg
                    );
                    self.sleep(delay).await?;
                }
                Err(e) => {
                    if matches!(e, BotError::RateLimited(_)) {
                        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("rate limit retries exhausted: {}", e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub fn status(&self) -> RateLimitStatus {
        let in_window = self
            .window
            .lock()
            .map(|mut w| w.in_window(Instant::now()))
            .unwrap_or(0);
        let max = self.config.max_requests_per_window;
        RateLimitStatus {
            requests_in_window: in_window,
            max_requests: max,
            remaining: max.saturating_sub(in_window),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        match &self.shutdown {
            Some(shutdown) => sleep_or_shutdown(delay, &mut shutdown.clone()).await,
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn config(max: usize) -> RateLimiterConfig {
        RateLimiterConfig {
            max_requests_per_window: max,
            window: Duration::from_secs(60),
            buffer: Duration::from_secs(1),
            burst_per_second: 1_000,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(32),
        }
    }

    #[test]
    fn test_window_wait_from_oldest_call() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        window.record(t0);
        window.record(t0 + Duration::from_secs(10));

        let wait = window
            .wait_needed(t0 + Duration::from_secs(20), Duration::from_secs(1))
            .unwrap();
        assert_eq!(wait, Duration::from_secs(41));

        // Oldest call has aged out
        assert!(window
            .wait_needed(t0 + Duration::from_secs(60), Duration::from_secs(1))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_when_budget_spent() {
        let limiter = RateLimiter::new(config(3)).unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait_if_needed().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.status().remaining, 0);

        limiter.wait_if_needed().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(61));
        assert_eq!(limiter.status().requests_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limited_with_backoff() {
        let limiter = RateLimiter::new(config(50)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let result = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BotError::RateLimited("429".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(limiter.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let limiter = RateLimiter::new(config(50)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<()> = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::RateLimited("429".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BotError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(limiter.status().consecutive_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let limiter = RateLimiter::new(config(50)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<()> = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::OrderRejected("insufficient margin".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BotError::OrderRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_wait() {
        let (tx, rx) = watch::channel(false);
        let limiter = RateLimiter::new(config(1)).unwrap().with_shutdown(rx);
        limiter.wait_if_needed().await.unwrap();

        tx.send(true).unwrap();
        assert!(matches!(
            limiter.wait_if_needed().await,
            Err(BotError::Shutdown)
        ));
    }

    #[test]
    fn test_rejects_zero_burst() {
        let mut cfg = config(10);
        cfg.burst_per_second = 0;
        assert!(RateLimiter::new(cfg).is_err());
    }
}
