use std::pin::Pin;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, sleep, Instant, Interval, MissedTickBehavior, Sleep};

/// Randomized election timeout. Each reset draws a fresh duration from
/// `[min, max)` so that nodes rarely time out together.
#[derive(Debug)]
pub struct ElectionTimer {
    sleep: Pin<Box<Sleep>>,
    min: Duration,
    max: Duration,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    pub fn with_rng(min: Duration, max: Duration, mut rng: StdRng) -> Self {
        let first = Self::draw(&mut rng, min, max);
        Self {
            sleep: Box::pin(sleep(first)),
            min,
            max,
            rng,
        }
    }

    fn draw(rng: &mut StdRng, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        rng.gen_range(min..max)
    }

    pub fn random_timeout(&mut self) -> Duration {
        Self::draw(&mut self.rng, self.min, self.max)
    }

    pub fn reset(&mut self) {
        let timeout = self.random_timeout();
        self.sleep.as_mut().reset(Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    /// Completes when the current deadline passes. Cancel-safe; the caller
    /// must `reset` before waiting again.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await
    }
}

/// Fixed-period heartbeat tick. Late ticks are delayed, not bunched.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Interval,
}

impl HeartbeatTimer {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Restarts the period from now; used right after broadcasting.
    pub fn reset(&mut self) {
        self.interval.reset();
    }
}
