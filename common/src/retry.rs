// Retry backoff with jitter for best-effort outbound deliveries

use rand::Rng;
use std::time::Duration;

/// Fixed-schedule backoff. Attempt N (zero-based) sleeps `delays[N]` plus up
/// to `jitter_factor` of it; once the schedule is exhausted the caller gives
/// up.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
    jitter_factor: f64,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>, jitter_factor: f64) -> Self {
        Self {
            delays,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Notification delivery schedule: 1s, 4s, 16s with 10% jitter
    pub fn notifier() -> Self {
        Self::new(
            vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
            0.1,
        )
    }

    /// Retries beyond the first attempt
    pub fn max_retries(&self) -> u32 {
        self.delays.len() as u32
    }

    /// Delay before retry `attempt` (zero-based), None once exhausted
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        let base = *self.delays.get(attempt as usize)?;
        if self.jitter_factor == 0.0 {
            return Some(base);
        }
        let base_ms = base.as_millis() as u64;
        let jitter_range_ms = (base_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };
        Some(Duration::from_millis(base_ms + jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_schedule() {
        let backoff = Backoff::new(
            vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
            0.0,
        );
        assert_eq!(backoff.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay(2), Some(Duration::from_secs(16)));
        assert_eq!(backoff.delay(3), None);
        assert_eq!(backoff.max_retries(), 3);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::notifier();
        for _ in 0..50 {
            let d = backoff.delay(0).unwrap().as_millis();
            assert!((1000..=1100).contains(&d), "delay {}ms outside jitter range", d);
        }
    }

    #[test]
    fn test_jitter_varies() {
        let backoff = Backoff::notifier();
        let samples: Vec<u128> = (0..30)
            .map(|_| backoff.delay(2).unwrap().as_millis())
            .collect();
        assert!(samples.iter().any(|&d| d != samples[0]));
    }
}
