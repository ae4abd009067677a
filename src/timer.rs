use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Scale `base` by a random factor in `[1 - spread, 1 + spread]`.
pub fn jittered(base: Duration, spread: f64) -> Duration {
    let spread = spread.clamp(0.0, 1.0);
    if spread == 0.0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range((1.0 - spread)..=(1.0 + spread));
    base.mul_f64(factor)
}

/// Exponential backoff with jitter for retrying registry operations.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Doubles each call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current, 0.2).min(self.max);
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Sleep until `at`, or forever if there is nothing to wait for. Handy as an
/// optional `select!` branch.
pub async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base, 0.2);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn backoff_grows_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
        assert!(delays[0] <= Duration::from_millis(120));
        assert!(delays[4] <= Duration::from_millis(400));
        assert!(delays[4] >= Duration::from_millis(320));
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(120));
    }
}
