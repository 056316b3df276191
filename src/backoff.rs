use std::time::Duration;

use rand::Rng;

/// Exponential backoff parameters for failed fetch tasks.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(24 * 60 * 60),
            base: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before redelivering a task that has failed `attempt + 1`
    /// times: exponential in the attempt, capped, with uniform jitter in
    /// the upper half so synchronized failures spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.init_backoff.as_secs_f64() * self.base.powi(attempt.min(63) as i32);
        let capped = exp.min(self.max_backoff.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(capped / 2.0..=capped);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let config = BackoffConfig::default();
        for attempt in 0..40 {
            let d = config.delay(attempt);
            let exp = (60.0 * 2f64.powi(attempt as i32)).min(24.0 * 3600.0);
            assert!(d.as_secs_f64() >= exp / 2.0 - 1e-6, "attempt {attempt}");
            assert!(d.as_secs_f64() <= exp + 1e-6, "attempt {attempt}");
        }
        assert!(config.delay(1000) <= config.max_backoff);
    }
}
