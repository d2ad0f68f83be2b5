use crate::filter::FilterError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::{Duration, Instant};

/// Errors that know whether another attempt is worthwhile
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for FilterError {
    fn is_transient(&self) -> bool {
        FilterError::is_transient(self)
    }
}

/// Exponential backoff timing shared by every packet-filter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Total budget across all attempts; 0 disables the limit
    pub max_elapsed_ms: u64,
    pub randomization_factor: f64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 1.5,
            max_interval_ms: 60_000,
            max_elapsed_ms: 15 * 60 * 1000,
            randomization_factor: 0.5,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts, give up after `attempts` tries
    pub fn immediate(attempts: u32) -> Self {
        Self {
            initial_interval_ms: 0,
            multiplier: 1.0,
            max_interval_ms: 0,
            max_elapsed_ms: 0,
            randomization_factor: 0.0,
            max_attempts: Some(attempts.max(1)),
        }
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// The error returned is always the one produced by the last attempt.
    pub fn retry<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + Display,
    {
        let mut backoff = Backoff::new(self);
        let mut attempt: u32 = 1;

        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                tracing::debug!(operation, attempt, error = %err, "permanent failure, not retrying");
                return Err(err);
            }

            let Some(delay) = backoff.next_delay(attempt) else {
                tracing::warn!(operation, attempt, error = %err, "retries exhausted");
                return Err(err);
            };

            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }
}

struct Backoff<'a> {
    policy: &'a RetryPolicy,
    current: Duration,
    started: Instant,
}

impl<'a> Backoff<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            current: Duration::from_millis(policy.initial_interval_ms),
            started: Instant::now(),
        }
    }

    /// Delay before the attempt after `attempt`, or `None` to give up
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let delay = jitter(self.current, self.policy.randomization_factor);
        if let Some(budget) = self.policy.max_elapsed() {
            if self.started.elapsed().saturating_add(delay) > budget {
                return None;
            }
        }

        let max_interval = Duration::from_millis(self.policy.max_interval_ms);
        let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
        // overflow and non-finite products land on the cap
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(max_interval)
            .min(max_interval);

        Some(delay)
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let base = interval.as_secs_f64();
    let low = (base * (1.0 - factor)).max(0.0);
    let high = base * (1.0 + factor.min(1.0));
    Duration::try_from_secs_f64(rand::thread_rng().gen_range(low..=high)).unwrap_or(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn transient() -> FilterError {
        FilterError::Unavailable {
            message: "xtables lock held".into(),
            transient: true,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, FilterError> = RetryPolicy::immediate(5).retry("test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(transient()) } else { Ok(7) }
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), FilterError> = RetryPolicy::immediate(4).retry("test", || {
            calls.set(calls.get() + 1);
            Err(FilterError::Unavailable {
                message: format!("attempt {}", calls.get()),
                transient: true,
            })
        });

        assert_eq!(calls.get(), 4);
        assert!(result.unwrap_err().to_string().contains("attempt 4"));
    }

    #[test]
    fn permanent_error_stops_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), FilterError> = RetryPolicy::immediate(10).retry("test", || {
            calls.set(calls.get() + 1);
            Err(FilterError::Unavailable {
                message: "no such binary".into(),
                transient: false,
            })
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn intervals_grow_and_cap() {
        let policy = RetryPolicy {
            initial_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 300,
            max_elapsed_ms: 0,
            randomization_factor: 0.0,
            max_attempts: None,
        };
        let mut backoff = Backoff::new(&policy);
        let delays: Vec<u128> = (1..=4)
            .map(|attempt| backoff.next_delay(attempt).unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn unbounded_growth_saturates_at_the_cap() {
        let policy = RetryPolicy {
            initial_interval_ms: 100,
            multiplier: f64::INFINITY,
            max_interval_ms: 400,
            max_elapsed_ms: 0,
            randomization_factor: 0.0,
            max_attempts: Some(5),
        };
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(400)));

        let policy = RetryPolicy {
            initial_interval_ms: 1,
            multiplier: 1000.0,
            max_interval_ms: u64::MAX,
            max_elapsed_ms: 0,
            randomization_factor: 0.5,
            max_attempts: None,
        };
        let mut backoff = Backoff::new(&policy);
        for attempt in 1..=20 {
            assert!(backoff.next_delay(attempt).is_some());
        }
    }

    #[test]
    fn infinite_multiplier_does_not_panic_while_retrying() {
        let policy = RetryPolicy {
            multiplier: f64::INFINITY,
            ..RetryPolicy::immediate(3)
        };
        let calls = Cell::new(0);
        let result: Result<(), FilterError> = policy.retry("test", || {
            calls.set(calls.get() + 1);
            Err(transient())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn elapsed_budget_stops_retries() {
        let policy = RetryPolicy {
            initial_interval_ms: 50,
            multiplier: 1.0,
            max_interval_ms: 50,
            max_elapsed_ms: 10,
            randomization_factor: 0.0,
            max_attempts: None,
        };
        let mut backoff = Backoff::new(&policy);
        assert!(backoff.next_delay(1).is_none());
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(1000), 0.5).as_millis();
            assert!((500..=1500).contains(&d));
        }
    }
}
