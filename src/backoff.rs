//! Randomised exponential backoff used by the reconnect loop and task loops.

use rand::Rng;
use std::time::{Duration, Instant};

const MAX_EXPONENT: u32 = 10;

/// Each call to [`delay`](ExponentialBackoff::delay) returns a random duration in
/// `[0, base * 2^exp)`, with `exp` growing by one per call up to 10. If the
/// previous call is older than `base * 2^11` seconds the exponent starts over.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: u32,
    exp: u32,
    reset_after: Duration,
    last_invocation: Instant,
    integral: bool,
}

impl ExponentialBackoff {
    pub fn new(base: u32, integral: bool) -> Self {
        let base = base.max(1);
        Self {
            base,
            exp: 0,
            reset_after: Duration::from_secs(u64::from(base) << 11),
            last_invocation: Instant::now(),
            integral,
        }
    }

    pub fn delay(&mut self) -> Duration {
        let invocation = Instant::now();
        let interval = invocation.duration_since(self.last_invocation);
        self.last_invocation = invocation;

        if interval > self.reset_after {
            self.exp = 0;
        }
        self.exp = (self.exp + 1).min(MAX_EXPONENT);

        let upper = f64::from(self.base) * f64::from(1u32 << self.exp);
        let mut rng = rand::thread_rng();
        if self.integral {
            Duration::from_secs(rng.gen_range(0..upper as u64))
        } else {
            Duration::from_secs_f64(rng.gen_range(0.0..upper))
        }
    }

    pub fn exponent(&self) -> u32 {
        self.exp
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(1, false)
    }
}
