// src/retry.rs

//! The retry policy (component C6): decides whether a failed command should
//! be retried and, if so, after how long. Grounded on the exponential
//! backoff shape in the teacher's `core/warden/worker.rs::run_pubsub_loop`
//! (double the delay each attempt, cap it, reset on success), adapted from a
//! reconnect loop into a per-command decision with an explicit retry budget
//! and jitter.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

use crate::command::Command;
use crate::error::Error;

/// Retry tuning, one instance shared by every client built from the same
/// [`crate::config::ClientOptions`] (spec §6 `MaxRetries`/`MinRetryBackoff`/`MaxRetryBackoff`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            min_backoff: Duration::from_millis(8),
            max_backoff: Duration::from_millis(512),
        }
    }
}

impl RetryPolicy {
    /// Decides whether `attempt` (0-indexed, the attempt that just failed)
    /// should be retried for `cmd`, given `err` and an overall `deadline`.
    ///
    /// Returns `None` when the command should not be retried: the attempt
    /// budget is exhausted, the deadline would already have passed by the
    /// time the backoff elapses, the error is not transient (spec §4.6), or
    /// the command is a write that is not known to be idempotent-safe to
    /// resend (spec §7: only readonly commands are retried automatically;
    /// callers opt non-readonly commands in explicitly by pre-pinning them).
    pub fn should_retry(
        &self,
        attempt: u32,
        cmd: &Command,
        err: &Error,
        deadline: Option<Instant>,
    ) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        if !cmd.readonly() && !cmd.pinned() {
            return None;
        }
        if !err.is_transient() {
            return None;
        }

        let backoff = self.backoff_for(attempt);
        if let Some(deadline) = deadline {
            if Instant::now() + backoff >= deadline {
                return None;
            }
        }
        Some(backoff)
    }

    /// Exponential backoff with full jitter: `random(0, min(max, min*2^attempt))`,
    /// the same doubling-then-capping shape as the teacher's reconnect loop,
    /// with jitter added so a thundering herd of callers does not retry in lockstep.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.min_backoff.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_backoff);
        let jittered_millis = rand::rngs::SmallRng::from_entropy().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;

    #[test]
    fn readonly_transient_errors_are_retried_within_budget() {
        let policy = RetryPolicy::default();
        let cmd = Command::new(["GET", "k"]);
        let err = Error::Server(ServerError::TryAgain("".into()));
        assert!(policy.should_retry(0, &cmd, &err, None).is_some());
        assert!(policy.should_retry(3, &cmd, &err, None).is_none());
    }

    #[test]
    fn writes_are_not_retried_unless_pinned() {
        let policy = RetryPolicy::default();
        let write = Command::new(["SET", "k", "v"]);
        let err = Error::closed("reset by peer");
        assert!(policy.should_retry(0, &write, &err, None).is_none());
        assert!(policy.should_retry(0, &write.pin(), &err, None).is_some());
    }

    #[test]
    fn non_transient_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        let cmd = Command::new(["GET", "k"]);
        let err = Error::Parse("bad reply".into());
        assert!(policy.should_retry(0, &cmd, &err, None).is_none());
    }

    #[test]
    fn deadline_in_the_past_stops_retries() {
        let policy = RetryPolicy::default();
        let cmd = Command::new(["GET", "k"]);
        let err = Error::closed("reset");
        let already_passed = Instant::now() - Duration::from_secs(1);
        assert!(policy.should_retry(0, &cmd, &err, Some(already_passed)).is_none());
    }

    #[test]
    fn backoff_grows_but_stays_capped() {
        let policy = RetryPolicy { max_retries: 10, ..RetryPolicy::default() };
        for attempt in 0..10 {
            let backoff = policy.backoff_for(attempt);
            assert!(backoff <= policy.max_backoff);
        }
    }
}
