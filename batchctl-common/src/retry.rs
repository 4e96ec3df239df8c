//! Backoff policy shared by webhook delivery retries and model-load retries.

use rand::Rng;
use std::time;

/// Computes the delay before the next retry attempt, combining exponential backoff with an
/// optional server-preferred delay (e.g. a webhook receiver's `Retry-After` header) and an
/// optional ceiling. Webhook deliveries additionally apply jitter so that a burst of deliveries
/// scheduled at the same instant doesn't retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff_coefficient: f64,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: f64,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Computes the time until the next retry, in milliseconds, given the number of attempts
    /// already made and an optional delay preferred by the remote server.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self.initial_interval.mul_f64(
            self.backoff_coefficient
                .powi(attempt.try_into().unwrap_or(i32::MAX)),
        );

        let capped_interval = match self.maximum_interval {
            Some(max) if candidate_interval > max => max,
            _ => candidate_interval,
        };

        match preferred_retry_interval {
            Some(preferred) if preferred > capped_interval => preferred,
            _ => capped_interval,
        }
    }

    /// Same as `time_until_next_retry`, but with up to ±20% jitter applied, for use where many
    /// deliveries might otherwise wake up and retry at the exact same instant.
    pub fn time_until_next_retry_jittered(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let base = self.time_until_next_retry(attempt, preferred_retry_interval);
        let jitter_factor = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(jitter_factor)
    }
}

impl Default for RetryPolicy {
    /// 2s, 4s, 8s, ... capped at 5 minutes, which is the default used for webhook delivery.
    fn default() -> Self {
        Self {
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: Some(time::Duration::from_secs(300)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_exponentially() {
        let policy = RetryPolicy::new(2.0, time::Duration::from_secs(1), None);
        assert_eq!(policy.time_until_next_retry(0, None), time::Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(1, None), time::Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(2, None), time::Duration::from_secs(4));
    }

    #[test]
    fn caps_at_maximum_interval() {
        let policy = RetryPolicy::new(
            2.0,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(3)),
        );
        assert_eq!(policy.time_until_next_retry(10, None), time::Duration::from_secs(3));
    }

    #[test]
    fn prefers_server_interval_when_larger() {
        let policy = RetryPolicy::new(2.0, time::Duration::from_secs(1), None);
        let preferred = time::Duration::from_secs(30);
        assert_eq!(policy.time_until_next_retry(0, Some(preferred)), preferred);
    }

    #[test]
    fn ignores_server_interval_when_smaller() {
        let policy = RetryPolicy::new(2.0, time::Duration::from_secs(10), None);
        let preferred = time::Duration::from_secs(1);
        assert_eq!(policy.time_until_next_retry(0, Some(preferred)), time::Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::new(2.0, time::Duration::from_secs(10), None);
        for _ in 0..100 {
            let jittered = policy.time_until_next_retry_jittered(0, None);
            assert!(jittered >= time::Duration::from_secs(8));
            assert!(jittered <= time::Duration::from_secs(12));
        }
    }
}
