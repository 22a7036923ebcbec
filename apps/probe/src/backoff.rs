use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with optional jitter.
///
/// `duration()` returns `min * factor^attempt` clamped to `max`; with
/// jitter enabled the delay is drawn uniformly from `[min, computed)`.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: bool) -> Self {
        Self { min, max, factor, jitter, attempt: 0 }
    }

    pub fn duration(&mut self) -> Duration {
        let exp = self.factor.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);

        let mut millis = self.min.as_secs_f64() * 1000.0 * exp;
        let max_millis = self.max.as_secs_f64() * 1000.0;
        if millis > max_millis {
            millis = max_millis;
        }
        if self.jitter {
            let min_millis = self.min.as_secs_f64() * 1000.0;
            if millis > min_millis {
                millis = rand::thread_rng().gen_range(min_millis..millis);
            }
        }
        Duration::from_secs_f64(millis / 1000.0)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
