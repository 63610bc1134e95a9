use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with ±50% jitter.
///
/// The first delay after a reset is zero; each later delay grows the base by
/// the configured factor up to the cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Forces the next delay to be the maximum, e.g. after the backend
    /// reported resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = (base + jitter).clamp(0.0, self.config.max_delay.as_secs_f64());

        let next = if self.current_base.is_zero() {
            self.config.initial_delay.as_secs_f64()
        } else {
            base * self.config.backoff_factor
        };
        self.current_base =
            Duration::from_secs_f64(next.min(self.config.max_delay.as_secs_f64()));
        Duration::from_secs_f64(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
