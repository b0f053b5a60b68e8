//! Reconnect policy: bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
    /// Attempts before giving up. `0` disables reconnecting.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Same delay every time, no jitter.
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_retries,
        }
    }

    pub fn disabled() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Delay for a 1-based attempt, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Apply jitter with `sample` drawn from `[-1.0, 1.0]`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }

    /// Delay before `attempt`, or `None` once retries are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        Some(self.delay_with_jitter(attempt, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_starts_at_three_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(3));
        assert_eq!(policy.base_delay(2), Duration::from_secs(6));
        assert_eq!(policy.base_delay(3), Duration::from_secs(12));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(4), Duration::from_secs(24));
        assert_eq!(policy.base_delay(5), Duration::from_secs(30));
        assert_eq!(policy.base_delay(60), Duration::from_secs(30));
    }

    fn approx(d: Duration, secs: f64) -> bool {
        (d.as_secs_f64() - secs).abs() < 1e-6
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy::default();
        assert!(approx(policy.delay_with_jitter(1, 1.0), 3.6));
        assert!(approx(policy.delay_with_jitter(1, -1.0), 2.4));
        assert!(approx(policy.delay_with_jitter(1, 0.0), 3.0));

        for attempt in 1..=10 {
            let delay = policy.next_delay(attempt).unwrap();
            let base = policy.base_delay(attempt).as_secs_f64();
            assert!(delay.as_secs_f64() >= base * 0.8 - 1e-6);
            assert!(delay.as_secs_f64() <= base * 1.2 + 1e-6);
        }
    }

    #[test]
    fn test_retries_are_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(policy.next_delay(0).is_none());
        assert!(policy.next_delay(10).is_some());
        assert!(policy.next_delay(11).is_none());
        assert!(ReconnectPolicy::disabled().next_delay(1).is_none());
    }

    #[test]
    fn test_fixed_policy() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(100), 3);
        for attempt in 1..=3 {
            assert!(approx(policy.next_delay(attempt).unwrap(), 0.1));
        }
        assert_eq!(policy.next_delay(4), None);
    }
}
