// src/dart/rate_limiter.rs
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_calls` acquisitions in any trailing
/// `period`.
///
/// The queue lock is held while sleeping, so waiting callers are released
/// roughly in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Waits until one more call fits in the window, then records it.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while let Some(oldest) = calls.front() {
                if now.duration_since(*oldest) >= self.period {
                    calls.pop_front();
                } else {
                    break;
                }
            }

            if calls.len() < self.max_calls {
                calls.push_back(now);
                return;
            }

            // Queue is full, so it has a front.
            if let Some(oldest) = calls.front() {
                let wait = self.period.saturating_sub(now.duration_since(*oldest));
                tracing::debug!("Rate limit window full, sleeping {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_window_respected(stamps: &[Instant], max_calls: usize, period: Duration) {
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < period)
                .count();
            assert!(
                in_window <= max_calls,
                "{} calls within {:?} starting at call {}",
                in_window,
                period,
                i
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_calls_pass_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_oldest_call_expires() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_calls_never_exceed_window() {
        let limiter = RateLimiter::new(5, Duration::from_millis(500));
        let mut stamps = Vec::new();
        for i in 0..40 {
            if i % 7 == 0 {
                tokio::time::sleep(Duration::from_millis(130)).await;
            }
            limiter.acquire().await;
            stamps.push(Instant::now());
        }
        assert_window_respected(&stamps, 5, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_window() {
        let limiter = Arc::new(RateLimiter::new(4, Duration::from_secs(2)));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let limiter = Arc::clone(&limiter);
            let stamps = Arc::clone(&stamps);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                stamps.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut stamps = stamps.lock().unwrap().clone();
        stamps.sort();
        assert_eq!(stamps.len(), 25);
        assert_window_respected(&stamps, 4, Duration::from_secs(2));
    }

    #[test]
    fn zero_budget_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_calls(), 1);
    }
}
