//! Retry and backoff schedules.
//!
//! Every retrying call site goes through [`RetryPolicy`]: the port allocator's
//! bind retries, the startup health wait and the crash recovery attempts.
//! A policy is just an ordered list of attempts, each with the delay to wait
//! before it runs.

use std::future::Future;
use std::time::Duration;

/// One scheduled attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: usize,
    /// Delay to wait before running this attempt.
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// `attempts` tries with `delay` between consecutive tries. The first try
    /// runs immediately. At least one attempt is always made.
    pub fn fixed(attempts: usize, delay: Duration) -> Self {
        let attempts = attempts.max(1);
        let mut delays = Vec::with_capacity(attempts);
        delays.push(Duration::ZERO);
        delays.extend(std::iter::repeat(delay).take(attempts - 1));
        Self { delays }
    }

    /// One attempt per entry, each preceded by its delay.
    ///
    /// `schedule([5s, 15s, 45s])` waits 5s, tries, waits 15s, tries, waits 45s,
    /// tries. An empty schedule degrades to a single immediate attempt.
    pub fn schedule(delays: impl IntoIterator<Item = Duration>) -> Self {
        let mut delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            delays.push(Duration::ZERO);
        }
        Self { delays }
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    /// Sum of all delays; the upper bound on time spent sleeping.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    pub fn attempts(&self) -> impl Iterator<Item = Attempt> + '_ {
        self.delays.iter().enumerate().map(|(i, delay)| Attempt {
            number: i + 1,
            delay: *delay,
        })
    }

    /// Run `op` until it succeeds or the schedule is exhausted.
    ///
    /// Returns the first success or the error from the final attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let total = self.max_attempts();
        // Both constructors guarantee at least one attempt, so `last` is the final one
        let last = Attempt {
            number: total,
            delay: self.delays.last().copied().unwrap_or_default(),
        };

        for attempt in self.attempts().take(total.saturating_sub(1)) {
            pause(attempt.delay).await;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::debug!(
                        attempt = attempt.number,
                        total,
                        error = %e,
                        "attempt failed, retrying"
                    );
                }
            }
        }

        pause(last.delay).await;
        op(last).await
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
