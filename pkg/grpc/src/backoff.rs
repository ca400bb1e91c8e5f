use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffOptions {
    /// Delay before the first retry after entering the failed state.
    pub initial_delay: Duration,

    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,

    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,

    /// Proportional jitter: each delay is scaled by a random factor in
    /// [1 - jitter, 1 + jitter].
    pub jitter: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 1.6,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff between reconnect attempts.
///
/// next_delay() is called once per failed pass; reset() is called on the
/// first success since the last failure so that a healthy connection that
/// later dies starts retrying quickly again.
pub struct Backoff {
    options: BackoffOptions,
    next_base: Duration,
}

impl Backoff {
    pub fn new(options: BackoffOptions) -> Self {
        let next_base = options.initial_delay;
        Self { options, next_base }
    }

    pub fn reset(&mut self) {
        self.next_base = self.options.initial_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base;
        self.next_base = std::cmp::min(
            base.mul_f64(self.options.multiplier),
            self.options.max_delay,
        );

        let spread = rand::thread_rng().gen_range(-self.options.jitter..=self.options.jitter);
        base.mul_f64(1.0 + spread)
    }
}
