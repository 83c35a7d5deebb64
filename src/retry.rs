use std::time::Duration;

use crate::models::retry::{RetryAction, RetryConfig};

/// Decides whether a failed attempt is retried and how long to wait.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `min(initial * multiplier^(attempt-1), max)` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let mut delay_ms = self.config.initial_delay_ms;

        for _ in 0..exponent {
            delay_ms = delay_ms.saturating_mul(self.config.backoff_multiplier);
            if delay_ms >= self.config.max_delay_ms {
                break;
            }
        }

        Duration::from_millis(delay_ms.min(self.config.max_delay_ms))
    }

    /// Base delay with uniform jitter in ±`jitter_ratio`, never above the cap
    /// and never below the longest delay the previous attempt could draw.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let (lower, upper) = self.jitter_band(attempt);

        let delay_ms = if upper > lower {
            rand::random_range(lower..=upper)
        } else {
            lower
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Bounds in milliseconds. Bands of successive attempts touch but never
    /// overlap, so delays cannot shrink for any ratio; at the cap the band
    /// collapses to the cap itself.
    fn jitter_band(&self, attempt: u32) -> (f64, f64) {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        let cap = self.config.max_delay_ms as f64;
        let base = |n: u32| self.base_delay(n).as_millis() as f64;
        let upper = |n: u32| (base(n) * (1.0 + ratio)).min(cap);

        let mut lower = base(attempt) * (1.0 - ratio);
        if attempt > 1 {
            lower = lower.max(upper(attempt - 1));
        }

        (lower, upper(attempt).max(lower))
    }

    /// Action after `attempt` (1-based) has failed.
    pub fn next_action(&self, attempt: u32) -> RetryAction {
        if attempt >= self.config.max_attempts {
            RetryAction::GiveUp
        } else {
            RetryAction::Retry(self.delay_for(attempt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(jitter_ratio: f64) -> RetryScheduler {
        RetryScheduler::new(RetryConfig {
            jitter_ratio,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn base_delay_doubles_until_cap() {
        let scheduler = scheduler(0.0);
        assert_eq!(scheduler.base_delay(1), Duration::from_secs(1));
        assert_eq!(scheduler.base_delay(2), Duration::from_secs(2));
        assert_eq!(scheduler.base_delay(5), Duration::from_secs(16));
        assert_eq!(scheduler.base_delay(6), Duration::from_secs(30));
        assert_eq!(scheduler.base_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let scheduler = scheduler(0.0);
        assert_eq!(
            scheduler.next_action(1),
            RetryAction::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            scheduler.next_action(2),
            RetryAction::Retry(Duration::from_secs(2))
        );
        assert_eq!(scheduler.next_action(3), RetryAction::GiveUp);
    }

    #[test]
    fn jitter_stays_in_band_and_under_cap() {
        let scheduler = scheduler(0.2);
        for _ in 0..200 {
            let delay = scheduler.delay_for(2).as_millis();
            assert!((1_600..=2_400).contains(&delay), "delay {delay}");

            let capped = scheduler.delay_for(10);
            assert!(capped <= Duration::from_secs(30));
        }
    }

    #[test]
    fn wide_jitter_never_shrinks_delays() {
        for ratio in [0.5, 0.9] {
            let scheduler = RetryScheduler::new(RetryConfig {
                max_attempts: 12,
                jitter_ratio: ratio,
                ..RetryConfig::default()
            });

            for _ in 0..200 {
                let delays: Vec<Duration> = (1..12).map(|n| scheduler.delay_for(n)).collect();
                assert!(
                    delays.windows(2).all(|w| w[0] <= w[1]),
                    "ratio {ratio}: {delays:?}"
                );
                assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
            }
        }
    }
}
