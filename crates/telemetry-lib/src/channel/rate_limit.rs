//! Token bucket pacing guest requests

use super::ChannelError;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Token bucket refilled continuously at `rate` tokens per second
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Bucket starting full; `burst` is its capacity
    pub fn new(rate: f64, burst: u32) -> Result<Self, ChannelError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ChannelError::InvalidConfig(format!(
                "rate must be positive, got {}",
                rate
            )));
        }
        if burst == 0 {
            return Err(ChannelError::InvalidConfig(
                "burst must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            refilled_at: Instant::now(),
        })
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.rate)
    }

    /// Wait for a token; returns false when cancelled first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if self.try_acquire() {
                return true;
            }

            let deadline = Instant::now() + self.until_next_token();
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline) => {}
            }
        }
    }
}
