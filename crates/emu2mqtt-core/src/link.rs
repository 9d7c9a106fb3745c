//! Per-link connection state machine and reconnect backoff.
//!
//! The serial link and the MQTT link each own one `LinkState`; the owning
//! task is the only writer. Modelling the two links separately (rather
//! than a shared "connected" flag) keeps a failure on one side from
//! leaking into the other's lifecycle.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Lifecycle state of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a reconnect delay after a failed attempt.
    Backoff { attempt: u32, until: Instant },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Exponential reconnect backoff with a cap and jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for the grown delay, before jitter.
    pub max: Duration,
    /// Fraction of the delay randomized in either direction, 0.0..=1.0.
    pub jitter: f64,
    /// Bounded timeout applied to each connect attempt.
    pub connect_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    /// Grows as `base * 2^attempt`, saturating at `max`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let grown = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        grown.min(self.max)
    }

    /// `raw_delay` with the jitter term applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= 0.0 {
            return raw;
        }
        let spread = raw.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((raw.as_secs_f64() + offset).max(0.0))
    }
}

/// Attempt bookkeeping around one link's connect/disconnect transitions.
/// Both link managers drive their `LinkState` watch through this so the
/// attempt counter rules stay identical on each side.
#[derive(Debug)]
pub struct Reconnector {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The link came up; the next failure backs off from the start again.
    pub fn connected(&mut self) -> LinkState {
        self.attempt = 0;
        LinkState::Connected
    }

    /// A connect attempt failed or an established link dropped.
    pub fn failed(&mut self, now: Instant) -> LinkState {
        let attempt = self.attempt;
        self.attempt = self.attempt.saturating_add(1);
        LinkState::Backoff {
            attempt,
            until: now + self.policy.delay(attempt),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.policy.connect_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.0,
            connect_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn delay_is_monotonic_up_to_cap() {
        let p = policy();
        let mut last = Duration::ZERO;
        for attempt in 0..16 {
            let d = p.raw_delay(attempt);
            assert!(d >= last, "attempt {attempt} shrank the delay");
            assert!(d <= p.max);
            last = d;
        }
        assert_eq!(p.raw_delay(15), p.max);
    }

    #[test]
    fn delay_saturates_at_extreme_attempts() {
        let p = policy();
        assert_eq!(p.raw_delay(u32::MAX), p.max);
    }

    #[test]
    fn jitter_keeps_delay_near_raw() {
        let p = BackoffPolicy {
            jitter: 0.1,
            ..policy()
        };
        for attempt in 0..8 {
            let raw = p.raw_delay(attempt).as_secs_f64();
            let jittered = p.delay(attempt).as_secs_f64();
            assert!((jittered - raw).abs() <= raw * 0.1 + f64::EPSILON);
        }
    }

    #[test]
    fn success_resets_the_attempt_counter() {
        let mut reconnect = Reconnector::new(policy());
        let now = Instant::now();
        for expected in 0..3 {
            match reconnect.failed(now) {
                LinkState::Backoff { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("expected backoff, got {other:?}"),
            }
        }
        assert_eq!(reconnect.connected(), LinkState::Connected);
        match reconnect.failed(now) {
            LinkState::Backoff { attempt, until } => {
                assert_eq!(attempt, 0);
                assert_eq!(until, now + policy().raw_delay(0));
            }
            other => panic!("expected backoff, got {other:?}"),
        }
    }

    #[test]
    fn connected_state_check() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(!LinkState::Backoff {
            attempt: 3,
            until: Instant::now()
        }
        .is_connected());
    }
}
