//! Bounded polling helper.
//!
//! Every "probe, sleep, probe again" loop in the crate goes through
//! [`poll_until`]: reconnect attempts, filesystem readiness after a connect,
//! the deep status probe and task-run polling. Each loop has a fixed interval
//! and an attempt ceiling, so none of them can spin forever.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Interval and attempt ceiling for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollPolicy {
    /// Delay between two consecutive probes.
    pub interval: Duration,
    /// Maximum number of probes (at least one probe always runs).
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Creates a policy probing every `interval`, at most `max_attempts` times.
    pub(crate) fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Creates a policy from an interval in milliseconds.
    pub(crate) fn from_millis(interval_ms: u64, max_attempts: u32) -> Self {
        Self::new(Duration::from_millis(interval_ms), max_attempts)
    }

    /// Upper bound on the time spent sleeping between probes.
    pub(crate) fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Why a polling loop stopped without a value.
#[derive(Debug)]
pub(crate) enum PollError<E> {
    /// Every attempt came back empty.
    Timeout { attempts: u32 },
    /// A probe failed with a non-retryable error.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { attempts } => write!(f, "gave up after {attempts} attempts"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Probes until `probe` yields a value, fails, or the attempts run out.
///
/// The probe receives the 1-based attempt number. `Ok(None)` means "not yet"
/// and schedules another attempt after `policy.interval`; `Err` stops the loop
/// immediately. No sleep happens after the final attempt.
pub(crate) async fn poll_until<T, E, F, Fut>(
    policy: PollPolicy,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        if let Some(value) = probe(attempt).await.map_err(PollError::Failed)? {
            return Ok(value);
        }
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(PollError::Timeout { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_value() {
        let start = Instant::now();
        let policy = PollPolicy::from_millis(1000, 5);

        let result: Result<u32, PollError<Infallible>> =
            poll_until(policy, |attempt| async move {
                Ok((attempt == 3).then_some(attempt))
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_trailing_sleep() {
        let start = Instant::now();
        let policy = PollPolicy::from_millis(1000, 5);

        let result: Result<(), PollError<Infallible>> =
            poll_until(policy, |_| async { Ok(None) }).await;

        let err = result.unwrap_err();
        assert!(matches!(err, PollError::Timeout { attempts: 5 }));
        assert_eq!(err.to_string(), "gave up after 5 attempts");
        assert_eq!(start.elapsed(), policy.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_stops_loop() {
        let mut calls = 0;
        let policy = PollPolicy::from_millis(500, 10);

        let result: Result<(), PollError<String>> = poll_until(policy, |_| {
            calls += 1;
            async { Err("boom".to_string()) }
        })
        .await;

        assert!(matches!(result, Err(PollError::Failed(ref e)) if e == "boom"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_probes_once() {
        let policy = PollPolicy::from_millis(10, 0);
        let result: Result<&str, PollError<Infallible>> =
            poll_until(policy, |_| async { Ok(Some("ready")) }).await;
        assert_eq!(result.unwrap(), "ready");
    }

    #[test]
    fn test_budget() {
        assert_eq!(
            PollPolicy::from_millis(1000, 5).budget(),
            Duration::from_secs(4)
        );
        assert_eq!(PollPolicy::from_millis(1000, 0).budget(), Duration::ZERO);
    }
}
