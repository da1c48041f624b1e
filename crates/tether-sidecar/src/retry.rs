//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Classification of one failed attempt.
#[derive(Debug)]
pub enum Failure<E> {
    /// Worth another attempt.
    Transient(E),
    /// Retrying cannot help.
    Permanent(E),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Cancelled,
    Permanent(E),
    /// The elapsed-time budget ran out; carries the last transient error.
    Exhausted(E),
}

/// Backoff schedule for retried operations.
///
/// Each delay is the current interval scaled by a random factor in
/// `[1 - randomization_factor, 1 + randomization_factor]`. The interval then
/// grows by `multiplier` up to `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// `None` retries until success or cancellation.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial_interval,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the elapsed
    /// budget, or `cancel` fires. Cancellation also interrupts an attempt in
    /// flight.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure<E>>>,
    {
        let started = Instant::now();
        let mut backoff = self.backoff();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = op() => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(Failure::Permanent(e)) => return Err(RetryError::Permanent(e)),
                Err(Failure::Transient(e)) => e,
            };

            let delay = backoff.next_delay();
            if let Some(budget) = self.max_elapsed {
                if started.elapsed().saturating_add(delay) > budget {
                    return Err(RetryError::Exhausted(error));
                }
            }

            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying");

            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Iterator-like source of successive delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let spread = base * self.policy.randomization_factor.clamp(0.0, 1.0);
        let delay = if spread > 0.0 {
            rand::thread_rng().gen_range((base - spread)..=(base + spread))
        } else {
            base
        };

        let cap = self.policy.max_interval;
        let grown = (base * self.policy.multiplier.max(1.0)).min(cap.as_secs_f64());
        self.current = Duration::try_from_secs_f64(grown).map_or(cap, |d| d.min(cap));

        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fixed(interval: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_interval: interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_interval: interval,
            max_elapsed: None,
        }
    }

    #[test]
    fn delays_grow_to_the_cap() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(300),
            max_elapsed: None,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 300, 300]);
    }

    #[test]
    fn huge_intervals_saturate() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            multiplier: f64::MAX,
            randomization_factor: 0.0,
            max_interval: Duration::MAX,
            max_elapsed: None,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<_> = (0..3).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::MAX, Duration::MAX]
        );
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(250));
        assert!(first <= Duration::from_millis(750));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<u32, RetryError<&str>> = fixed(Duration::from_millis(1))
            .run(&cancel, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Failure::Transient("refused"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = fixed(Duration::from_millis(1))
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Permanent("bad request"))
            })
            .await;

        assert_eq!(result, Err(RetryError::Permanent("bad request")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_budget_is_honoured() {
        let mut policy = fixed(Duration::from_millis(20));
        policy.max_elapsed = Some(Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = policy
            .run(&cancel, || async { Err(Failure::Transient("refused")) })
            .await;

        assert_eq!(result, Err(RetryError::Exhausted("refused")));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = fixed(Duration::from_secs(3600));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<&str>> = policy
            .run(&cancel, || async { Err(Failure::Transient("refused")) })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = RetryPolicy::default()
            .run(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
