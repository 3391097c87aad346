//! Reconnection backoff policy.
//!
//! The policy is a pure function from the consecutive-failure counter to the
//! delay before the next attempt. Returning `None` stops automatic
//! reconnection and moves the connection to its terminal state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Maps a reconnect attempt number (starting at 1) to a delay, or to `None`
/// to give up.
#[derive(Clone)]
pub struct ReconnectPolicy {
    inner: Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>,
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ReconnectPolicy(..)")
    }
}

impl Default for ReconnectPolicy {
    /// Ramps up in 50ms steps and caps at two seconds, retrying forever.
    fn default() -> ReconnectPolicy {
        ReconnectPolicy::new(|attempt| {
            Some(Duration::from_millis((attempt as u64 * 50).min(2_000)))
        })
    }
}

impl ReconnectPolicy {
    /// Builds a policy from a custom function.
    pub fn new<F>(f: F) -> ReconnectPolicy
    where
        F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        ReconnectPolicy { inner: Arc::new(f) }
    }

    /// Doubles the delay on every attempt, starting at `base` and capped at
    /// `cap`, with up to 25% random jitter to avoid thundering herds.
    pub fn exponential(base: Duration, cap: Duration) -> ReconnectPolicy {
        ReconnectPolicy::new(move |attempt| {
            let exp = attempt.saturating_sub(1).min(32);
            let raw = base
                .saturating_mul(2u32.saturating_pow(exp))
                .min(cap)
                .as_millis() as u64;
            let jitter = rand::thread_rng().gen_range(0..=raw / 4 + 1);
            Some(Duration::from_millis(raw + jitter))
        })
    }

    /// The same delay on every attempt.
    pub fn fixed(delay: Duration) -> ReconnectPolicy {
        ReconnectPolicy::new(move |_| Some(delay))
    }

    /// Never reconnects.
    pub fn none() -> ReconnectPolicy {
        ReconnectPolicy::new(|_| None)
    }

    /// Wraps this policy to give up after `attempts` tries.
    pub fn with_max_attempts(self, attempts: u32) -> ReconnectPolicy {
        let inner = self.inner;
        ReconnectPolicy::new(move |attempt| {
            if attempt > attempts {
                None
            } else {
                inner(attempt)
            }
        })
    }

    /// Evaluates the policy for the given attempt number.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (self.inner)(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ramps_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(1000), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn max_attempts_stops_retrying() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(1)).with_max_attempts(3);
        assert!(policy.delay_for(3).is_some());
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn none_never_retries() {
        assert_eq!(ReconnectPolicy::none().delay_for(1), None);
    }

    #[test]
    fn exponential_growth_is_capped() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_millis(10), Duration::from_millis(100));
        let d = policy.delay_for(30).unwrap();
        assert!(d >= Duration::from_millis(100));
        assert!(d <= Duration::from_millis(130));
    }
}
