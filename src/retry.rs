//! Timeout-budgeted polling
//!
//! Every wait on the array (PiT mappings settling, volume copies syncing,
//! mappings draining before a delete) goes through [`PollPolicy::poll_until`].
//! The interval schedule comes from an exponential backoff with no jitter;
//! the overall budget is a deadline measured on the tokio clock, so a wait
//! never outlives the operation that started it. Nothing is held locked
//! while sleeping.

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Outcome of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// The awaited condition holds
    Done(T),
    /// Not there yet, poll again after the next interval
    Pending,
}

/// Polling schedule and budget
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second poll
    pub interval: Duration,
    /// Growth factor applied to the interval after each poll
    pub multiplier: f64,
    /// Upper bound on a single interval
    pub max_interval: Duration,
    /// Total budget for the wait
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            multiplier: 1.0,
            max_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    /// Fixed-interval policy
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            multiplier: 1.0,
            max_interval: interval,
            timeout,
        }
    }

    /// Same schedule with a different budget
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval)
            .with_randomization_factor(0.0)
            .with_multiplier(self.multiplier.max(1.0))
            .with_max_interval(self.max_interval.max(self.interval))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Poll `check` until it reports [`Progress::Done`] or the budget runs out.
    ///
    /// Errors that classify as retryable array conflicts
    /// ([`Error::InvalidStateTransition`]) are logged and polled again;
    /// every other error ends the wait immediately. A zero budget times
    /// out without polling.
    pub async fn poll_until<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Progress<T>>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut schedule = self.schedule();
        let mut attempt: u32 = 0;

        while Instant::now() < deadline {
            attempt += 1;
            match check().await {
                Ok(Progress::Done(value)) => {
                    debug!("{} settled after {} poll(s)", what, attempt);
                    return Ok(value);
                }
                Ok(Progress::Pending) => {}
                Err(err @ Error::InvalidStateTransition { .. }) => {
                    warn!("{}: array rejected transition, retrying: {}", what, err);
                }
                Err(err) => return Err(err),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let pause = schedule.next_backoff().unwrap_or(self.interval);
            sleep(pause.min(remaining)).await;
        }

        Err(Error::Timeout {
            what: what.to_string(),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_until_done() {
        let policy = PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(2));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = policy
            .poll_until("counter", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    Ok(Progress::Done(n))
                } else {
                    Ok(Progress::Pending)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = PollPolicy::fixed(Duration::from_millis(5), Duration::from_millis(30));

        let result: Result<()> = policy
            .poll_until("never", || async { Ok(Progress::Pending) })
            .await;

        assert_matches!(result, Err(Error::Timeout { ref what, .. }) if what == "never");
    }

    #[tokio::test]
    async fn test_zero_budget_never_polls() {
        let policy = PollPolicy::fixed(Duration::from_millis(1), Duration::ZERO);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = policy
            .poll_until("zero", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Progress::Done(()))
            })
            .await;

        assert_matches!(result, Err(Error::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_conflicts_are_retried() {
        let policy = PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(2));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = policy
            .poll_until("conflict", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::InvalidStateTransition {
                        mapping: "1".into(),
                        state: "copying".into(),
                        event: "stop".into(),
                    })
                } else {
                    Ok(Progress::Done("ok"))
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_terminal_errors_stop_polling() {
        let policy = PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(2));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<()> = policy
            .poll_until("missing", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidInput("gone".into()))
            })
            .await;

        assert_matches!(result, Err(Error::InvalidInput(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_grows_and_caps() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(300),
            timeout: Duration::from_secs(10),
        };
        let mut schedule = policy.schedule();
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(schedule.next_backoff(), Some(Duration::from_millis(300)));
    }
}
