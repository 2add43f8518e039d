//! Bounded polling with backoff.
//!
//! Interface waits, handle recovery and rule confirmation all share the
//! same shape: check a condition, sleep, check again, give up at a
//! deadline. There is no external cancellation; the timeout is the only
//! way a poll ends without success.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Sleep schedule between polls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// First delay
    pub initial: Duration,
    /// Growth applied after each delay (1.0 = constant)
    pub factor: f64,
    /// Upper bound for a single delay
    pub max: Duration,
}

impl Backoff {
    pub fn exponential(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    pub fn constant(delay: Duration) -> Self {
        Self::exponential(delay, 1.0, delay)
    }

    /// Delay to use after `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor.max(1.0)).min(self.max)
    }

    /// The first `n` delays of this schedule
    pub fn delays(&self, n: usize) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(n);
        let mut delay = self.initial.min(self.max);
        for _ in 0..n {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
///
/// `check` always runs at least once, and once more at the deadline.
/// Returns whether the condition was met.
pub async fn poll_until<F, Fut>(timeout: Duration, backoff: &Backoff, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut delay = backoff.initial.min(backoff.max);

    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(delay.min(deadline - now)).await;
        delay = backoff.next_delay(delay);
    }
}
